//! Synthetic profile and memory layout shared by the unit and integration tests.
//!
//! Code lives at `K`; the stack holds the anchor at slot 0x30, a decoy code
//! address at 0x34 and the caller at 0x38. Only public paths are used, so the
//! library's own tests include this file as well.
#![allow(dead_code)]

use sigpatch_core::{MemoryView, Profile, SparseMemory};

pub const K: u64 = 0xFFFF_FFFF_8100_0000;
pub const STACK: u64 = 0xFFFF_C900_0000_0000;

pub const ANCHOR: u64 = K + 0x1000;
pub const STRING: u64 = K + 0x3000;
pub const LOG: u64 = K + 0x2000;
pub const CALLER: u64 = K + 0x400;
pub const ROUTINE: u64 = K + 0x800;
pub const TARGET: u64 = K + 0xA00;
pub const CALL_SITE: u64 = TARGET + 0x24;
pub const COMPLETE: u64 = K + 0x2300;
pub const DECOY: u64 = K + 0x3800;

pub const ANCHOR_SLOT: usize = 0x30;
pub const DECOY_SLOT: usize = 0x34;
pub const CALLER_SLOT: usize = 0x38;

pub const SAMPLE_JSON: &str = r#"{
  "name": "synthetic",
  "version": "1.0",
  "anchor": {
    "window_start": 40,
    "window_end": 72,
    "pattern": "48 89 C6 48 85 C0 74 0E 48 C7 C7 ?? ?? ?? ?? E8 ?? ?? ?? ?? EB 2D 90 90",
    "aux": {
      "kind": "string_reference",
      "operand_offset": 11,
      "encoding": { "kind": "sign_extended" },
      "addend": 2,
      "expected": "boot: hello\n"
    },
    "base_call": { "operand_offset": 16, "instruction_end": 20 }
  },
  "offsets": {
    "base": "log",
    "entries": { "alloc": "-0x800", "sleep": "0x100", "spawn": "0x200" }
  },
  "caller": {
    "window_end": 64,
    "sequence": {
      "min_consecutive_calls": 10,
      "terminator": "0F AE F0",
      "max_scan_bytes": 256
    }
  },
  "prologue": { "pattern": "0F 1F 44 00 00 55 48 89 E5 E8", "displacement_offset": 10 },
  "call_site": { "offset": 36 },
  "templates": [
    {
      "id": "banner",
      "bytes": "01 36 68 69 0A 00 50 48 C7 C7 00 00 00 00 E8 00 00 00 00 58",
      "entry": 6,
      "slots": [
        { "offset": 10, "kind": "absolute_signed32", "target": { "self_offset": 0 } },
        { "offset": 15, "kind": { "relative32": { "instruction_length": 4 } }, "target": { "symbol": "log" } }
      ]
    },
    {
      "id": "worker",
      "bytes": "77 6F 72 6B 65 72 00 57 48 B8 00 00 00 00 00 00 00 00 FF D0 5F C3",
      "entry": 7,
      "slots": [
        { "offset": 10, "kind": "absolute64", "target": { "symbol": "sleep" } }
      ]
    },
    {
      "id": "launcher",
      "bytes": "E8 00 00 00 00 48 8D 3D 00 00 00 00 E8 00 00 00 00 E8 00 00 00 00 E9 00 00 00 00",
      "slots": [
        { "offset": 1, "kind": { "relative32": { "instruction_length": 4 } }, "target": { "symbol": "alloc" } },
        { "offset": 8, "kind": { "relative32": { "instruction_length": 4 } }, "target": { "template": "worker" }, "addend": 7 },
        { "offset": 13, "kind": { "relative32": { "instruction_length": 4 } }, "target": { "symbol": "spawn" } },
        { "offset": 18, "kind": { "relative32": { "instruction_length": 4 } }, "target": { "symbol": "call_site_target" } },
        { "offset": 23, "kind": { "relative32": { "instruction_length": 4 } }, "target": { "symbol": "call_site" }, "addend": 5 }
      ]
    }
  ],
  "patch1": ["banner"],
  "patch2": ["worker", "launcher"]
}"#;

pub const SAMPLE_TOML: &str = r#"
name = "synthetic"
patch1 = ["banner"]
patch2 = ["tail"]

[anchor]
window_start = 0x28
window_end = 0x48
pattern = "48 89 C6 48 85 C0 74 0E 48 C7 C7 ?? ?? ?? ?? E8 ?? ?? ?? ?? EB 2D 90 90"
base_call = { operand_offset = 16, instruction_end = 20 }

[offsets]
base = "log"
entries = { alloc = "-0x800" }

[caller]
window_end = 0x40
sequence = { min_consecutive_calls = 10, terminator = "0F AE F0", max_scan_bytes = 256 }

[prologue]
pattern = "0F 1F 44 00 00 55 48 89 E5 E8"
displacement_offset = 10

[call_site]
offset = 0x24

[[templates]]
id = "banner"
bytes = "50 E8 00 00 00 00 58"
entry = 0
slots = [{ offset = 2, kind = { relative32 = { instruction_length = 4 } }, target = { symbol = "log" } }]

[[templates]]
id = "tail"
bytes = "E9 00 00 00 00"
slots = [{ offset = 1, kind = { relative32 = { instruction_length = 4 } }, target = { symbol = "call_site" }, addend = 5 }]
"#;

pub fn sample_profile() -> Profile {
    serde_json::from_str(SAMPLE_JSON).expect("sample profile parses")
}

/// Memory matching [`sample_profile`], plus the stack pointer at trigger time.
pub fn sample_memory() -> (SparseMemory, u64) {
    memory_with_caller(CALLER)
}

/// Same layout with the call run (and the caller stack slot) moved to `caller`.
pub fn memory_with_caller(caller: u64) -> (SparseMemory, u64) {
    let mut code = Layout::new(K, 0x4000);
    code.put(
        ANCHOR,
        &[0x48, 0x89, 0xC6, 0x48, 0x85, 0xC0, 0x74, 0x0E, 0x48, 0xC7, 0xC7],
    );
    code.put(ANCHOR + 0x0B, &(STRING as i64 as i32).to_le_bytes());
    code.rel32(ANCHOR + 0x0F, 0xE8, LOG);
    code.put(ANCHOR + 0x14, &[0xEB, 0x2D, 0x90, 0x90]);
    code.put(STRING, b"\x016boot: hello\n\0");

    for i in 0..12u64 {
        let target = if i == 11 { ROUTINE } else { K + 0x1800 + i * 0x10 };
        code.rel32(caller + i * 5, 0xE8, target);
    }
    code.put(caller + 60, &[0x0F, 0xAE, 0xF0]);

    code.put(ROUTINE, &[0x0F, 0x1F, 0x44, 0x00, 0x00, 0x55, 0x48, 0x89, 0xE5]);
    code.rel32(ROUTINE + 9, 0xE8, TARGET);
    code.rel32(CALL_SITE, 0xE8, COMPLETE);

    let mut words = vec![0u64; 0x100];
    words[0x29] = STACK + 0x100;
    words[ANCHOR_SLOT] = ANCHOR;
    words[DECOY_SLOT] = DECOY;
    words[CALLER_SLOT] = caller;
    let stack: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();

    let mut memory = SparseMemory::new();
    memory.map(K, code.bytes).expect("code region maps");
    memory.map(STACK, stack).expect("stack region maps");
    (memory, STACK)
}

/// Absolute target of the rel32 at `at` whose instruction ends at `next_ip`.
pub fn decode_rel32(memory: &SparseMemory, at: u64, next_ip: u64) -> u64 {
    let disp = memory.read_i32(at).expect("rel32 is mapped");
    (next_ip as i64 + disp as i64) as u64
}

/// `opcode rel32` placed at `at` and reaching `target`.
pub fn rel32_insn(opcode: u8, at: u64, target: u64) -> Vec<u8> {
    let disp = (target as i64).wrapping_sub(at as i64 + 5) as i32;
    let mut insn = vec![opcode];
    insn.extend_from_slice(&disp.to_le_bytes());
    insn
}

struct Layout {
    base: u64,
    bytes: Vec<u8>,
}

impl Layout {
    fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: vec![0; size],
        }
    }

    fn put(&mut self, at: u64, bytes: &[u8]) {
        let start = (at - self.base) as usize;
        self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn rel32(&mut self, at: u64, opcode: u8, target: u64) {
        self.put(at, &rel32_insn(opcode, at, target));
    }
}
