use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Read;
use std::path::Path;

use tracing::{debug, error};

use super::{FormatError, Mnemonic, Op};

pub const MAGIC: &[u8; 5] = b"TRN01";

/// Whole-file loads larger than this are rejected before parsing.
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Upper bound on local slots per function. Slot indices at or above it
/// are rejected at load time and faulted at run time.
pub const MAX_LOCALS: usize = u16::MAX as usize + 1;

const LOCAL_FN_MARKER: u8 = 0x01;
const IMPORTED_FN_MARKER: u8 = 0x02;

// ── Function table ───────────────────────────────────────────────────

/// A function body compiled into this program.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFunction {
    pub ops: Vec<Op>,
    /// Number of local slots the body addresses (highest GETL/SETL slot + 1).
    pub local_count: usize,
}

impl LocalFunction {
    pub fn new(ops: Vec<Op>) -> Self {
        let local_count = ops
            .iter()
            .filter(|op| matches!(op.mnemonic, Mnemonic::GetL | Mnemonic::SetL))
            .map(|op| op.data_index() + 1)
            .max()
            .unwrap_or(0);
        LocalFunction { ops, local_count }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionTableEntry {
    /// Placeholder for a slot that was never filled. Never executed or saved.
    Invalid,
    Local(LocalFunction),
    /// Reserved for cross-file linking; the VM refuses to run these.
    Imported { source_file: String, name: String },
}

/// Receives the output of the code generator.
pub trait ProgramScaffolding {
    fn set_string(&mut self, id: usize, value: String);
    fn set_function(&mut self, id: usize, name: String, entry: FunctionTableEntry);
}

// ── Program ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledProgram {
    pub strings: Vec<String>,
    pub functions: Vec<FunctionTableEntry>,
    /// function name -> function id
    pub names: HashMap<String, usize>,
}

impl ProgramScaffolding for CompiledProgram {
    fn set_string(&mut self, id: usize, value: String) {
        if id >= self.strings.len() {
            self.strings.resize(id + 1, String::new());
        }
        self.strings[id] = value;
    }

    fn set_function(&mut self, id: usize, name: String, entry: FunctionTableEntry) {
        if id >= self.functions.len() {
            self.functions.resize(id + 1, FunctionTableEntry::Invalid);
        }
        self.functions[id] = entry;
        self.names.insert(name, id);
    }
}

impl CompiledProgram {
    pub fn new() -> Self {
        CompiledProgram::default()
    }

    pub fn function_id(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    pub fn function(&self, id: usize) -> Option<&FunctionTableEntry> {
        self.functions.get(id)
    }

    pub fn string(&self, id: usize) -> Option<&str> {
        self.strings.get(id).map(String::as_str)
    }

    /// Name table sorted by function id.
    fn names_by_id(&self) -> Vec<(&str, usize)> {
        let mut names: Vec<(&str, usize)> =
            self.names.iter().map(|(n, id)| (n.as_str(), *id)).collect();
        names.sort_by_key(|(_, id)| *id);
        names
    }

    // ---- Serialization ----

    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        if self.functions.len() != self.names.len() {
            return Err(FormatError::TableMismatch {
                functions: self.functions.len(),
                names: self.names.len(),
            });
        }
        if let Some(id) = self.functions.iter().position(|f| *f == FunctionTableEntry::Invalid) {
            error!(id, "refusing to save a program with an unset function entry");
            return Err(FormatError::InvalidEntry { id });
        }

        let mut w = Writer::default();
        w.bytes(MAGIC);

        w.i32(self.strings.len() as i32);
        for s in &self.strings {
            w.string(s);
        }

        w.i32(self.names.len() as i32);
        for (name, id) in self.names_by_id() {
            w.i32(id as i32);
            w.string(name);
        }

        for entry in &self.functions {
            match entry {
                FunctionTableEntry::Local(f) => {
                    w.u8(LOCAL_FN_MARKER);
                    w.i32(f.ops.len() as i32);
                    for op in &f.ops {
                        w.i64(op.to_bits());
                    }
                }
                FunctionTableEntry::Imported { source_file, name } => {
                    w.u8(IMPORTED_FN_MARKER);
                    w.string(source_file);
                    w.string(name);
                }
                FunctionTableEntry::Invalid => unreachable!("checked above"),
            }
        }

        Ok(w.buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<CompiledProgram, FormatError> {
        let result = Self::read_program(&mut Reader::new(bytes));
        if let Err(e) = &result {
            error!("error reading program from buffer: {}", e);
        }
        result
    }

    fn read_program(r: &mut Reader<'_>) -> Result<CompiledProgram, FormatError> {
        let magic = r.bytes(MAGIC.len())?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic { found: magic.to_vec() });
        }

        let mut program = CompiledProgram::new();

        let string_count = r.length("string table")?;
        for _ in 0..string_count {
            program.strings.push(r.string()?);
        }

        let fn_count = r.length("function table")?;
        for _ in 0..fn_count {
            let id = r.i32()?;
            let name = r.string()?;
            if id < 0 || id as usize >= fn_count {
                return Err(FormatError::FunctionIdOutOfRange { id });
            }
            program.names.insert(name, id as usize);
        }

        for _ in 0..fn_count {
            let offset = r.pos;
            let entry = match r.u8()? {
                LOCAL_FN_MARKER => {
                    let count = r.length("instruction")?;
                    let mut ops = Vec::with_capacity(count.min(r.remaining() / 8));
                    for _ in 0..count {
                        ops.push(Op::decode(r.i64()?)?);
                    }
                    let function = LocalFunction::new(ops);
                    if function.local_count > MAX_LOCALS {
                        return Err(FormatError::TooManyLocals {
                            id: program.functions.len(),
                            slot: function.local_count - 1,
                            max: MAX_LOCALS,
                        });
                    }
                    FunctionTableEntry::Local(function)
                }
                IMPORTED_FN_MARKER => {
                    let source_file = r.string()?;
                    let name = r.string()?;
                    FunctionTableEntry::Imported { source_file, name }
                }
                marker => return Err(FormatError::UnknownFunctionKind { marker, offset }),
            };
            program.functions.push(entry);
        }

        debug!(
            strings = program.strings.len(),
            functions = program.functions.len(),
            "loaded program"
        );
        Ok(program)
    }

    /// Loads a compiled program from disk, enforcing [`MAX_FILE_SIZE`].
    pub fn load_file(path: impl AsRef<Path>) -> Result<CompiledProgram, FormatError> {
        let file = std::fs::File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        if size > MAX_FILE_SIZE {
            return Err(FormatError::FileTooLarge { size, max: MAX_FILE_SIZE });
        }
        let mut bytes = Vec::with_capacity(size as usize);
        file.take(MAX_FILE_SIZE + 1).read_to_end(&mut bytes)?;
        if bytes.len() as u64 > MAX_FILE_SIZE {
            return Err(FormatError::FileTooLarge { size: bytes.len() as u64, max: MAX_FILE_SIZE });
        }
        CompiledProgram::from_bytes(&bytes)
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<(), FormatError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    // ---- Disassembly ----

    pub fn disassemble(&self) -> String {
        let mut out = String::new();

        out.push_str("String Table:\n");
        for (i, s) in self.strings.iter().enumerate() {
            let _ = writeln!(out, "  {}: {}", i, s);
        }

        out.push_str("\nFunction ID Table:\n");
        for (name, id) in self.names_by_id() {
            let _ = writeln!(out, "  {}: {}", id, name);
        }

        out.push_str("\nImplementation:\n");
        for (i, entry) in self.functions.iter().enumerate() {
            match entry {
                FunctionTableEntry::Invalid => {
                    let _ = writeln!(out, "  {}: INVALID\n", i);
                }
                FunctionTableEntry::Imported { source_file, name } => {
                    let _ = writeln!(out, "  {}: Imported {}:{}\n", i, source_file, name);
                }
                FunctionTableEntry::Local(f) => {
                    let _ = writeln!(out, "  {}: Local", i);
                    for (j, op) in f.ops.iter().enumerate() {
                        let _ = writeln!(out, "    {}: {}", j, op);
                    }
                }
            }
        }

        out
    }
}

// ── Byte IO ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn string(&mut self, s: &str) {
        self.i32(s.len() as i32);
        self.bytes(s.as_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < n {
            return Err(FormatError::UnexpectedEof { offset: self.pos });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.array::<1>()?[0])
    }

    fn i32(&mut self) -> Result<i32, FormatError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, FormatError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn length(&mut self, what: &'static str) -> Result<usize, FormatError> {
        let offset = self.pos;
        let len = self.i32()?;
        if len < 0 {
            return Err(FormatError::NegativeLength { what, len, offset });
        }
        Ok(len as usize)
    }

    fn string(&mut self) -> Result<String, FormatError> {
        let len = self.length("string")?;
        let offset = self.pos;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| FormatError::InvalidUtf8 { offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CompiledProgram {
        let mut p = CompiledProgram::new();
        p.set_string(0, "log".to_string());
        p.set_string(1, "hello".to_string());
        p.set_function(
            0,
            "main".to_string(),
            FunctionTableEntry::Local(LocalFunction::new(vec![
                Op::new(Mnemonic::PushI, -7),
                Op::float(Mnemonic::PushF, 2.5),
                Op::new(Mnemonic::SetL, 3),
                Op::new(Mnemonic::PushS, 1),
                Op::new(Mnemonic::PushS, 0),
                Op::new(Mnemonic::Ext, 1),
                Op::bare(Mnemonic::PushUnit),
                Op::bare(Mnemonic::Retn),
            ])),
        );
        p.set_function(
            1,
            "far".to_string(),
            FunctionTableEntry::Imported { source_file: "lib.tern".into(), name: "far".into() },
        );
        p
    }

    #[test]
    fn round_trip_preserves_tables() {
        let p = sample();
        let bytes = p.to_bytes().unwrap();
        assert_eq!(&bytes[..5], MAGIC);
        let back = CompiledProgram::from_bytes(&bytes).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn local_count_from_slots() {
        let f = LocalFunction::new(vec![Op::new(Mnemonic::SetL, 4), Op::new(Mnemonic::GetL, 2)]);
        assert_eq!(f.local_count, 5);
        assert_eq!(LocalFunction::new(vec![]).local_count, 0);
    }

    #[test]
    fn set_function_grows_with_invalid_entries() {
        let mut p = CompiledProgram::new();
        p.set_function(2, "c".into(), FunctionTableEntry::Local(LocalFunction::new(vec![])));
        assert_eq!(p.functions.len(), 3);
        assert_eq!(p.functions[0], FunctionTableEntry::Invalid);
        assert_eq!(p.function_id("c"), Some(2));
    }

    #[test]
    fn save_rejects_invalid_entry() {
        let mut p = CompiledProgram::new();
        p.set_function(1, "b".into(), FunctionTableEntry::Local(LocalFunction::new(vec![])));
        p.names.insert("a".into(), 0);
        assert!(matches!(p.to_bytes(), Err(FormatError::InvalidEntry { id: 0 })));
    }

    #[test]
    fn save_rejects_table_mismatch() {
        let mut p = sample();
        p.names.insert("ghost".into(), 0);
        assert!(matches!(p.to_bytes(), Err(FormatError::TableMismatch { functions: 2, names: 3 })));
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(CompiledProgram::from_bytes(&bytes), Err(FormatError::BadMagic { .. })));
    }

    #[test]
    fn negative_string_table_length() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&(-1i32).to_be_bytes());
        assert!(matches!(
            CompiledProgram::from_bytes(&bytes),
            Err(FormatError::NegativeLength { what: "string table", len: -1, .. })
        ));
    }

    #[test]
    fn unknown_function_marker() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.push(b'f');
        bytes.push(0x09);
        assert!(matches!(
            CompiledProgram::from_bytes(&bytes),
            Err(FormatError::UnknownFunctionKind { marker: 0x09, .. })
        ));
    }

    #[test]
    fn unknown_opcode_in_body() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.push(b'f');
        bytes.push(LOCAL_FN_MARKER);
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.extend_from_slice(&(0x63i64 << 56).to_be_bytes());
        assert!(matches!(
            CompiledProgram::from_bytes(&bytes),
            Err(FormatError::UnknownOpcode { code: 0x63 })
        ));
    }

    #[test]
    fn truncated_input() {
        let bytes = sample().to_bytes().unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(CompiledProgram::from_bytes(cut), Err(FormatError::UnexpectedEof { .. })));
    }

    #[test]
    fn load_file_rejects_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.ternc");
        std::fs::write(&path, vec![0u8; (MAX_FILE_SIZE + 1) as usize]).unwrap();
        assert!(matches!(
            CompiledProgram::load_file(&path),
            Err(FormatError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.ternc");
        let p = sample();
        p.save_file(&path).unwrap();
        assert_eq!(CompiledProgram::load_file(&path).unwrap(), p);
    }

    #[test]
    fn disassembly_lists_everything() {
        let mut p = sample();
        p.functions.push(FunctionTableEntry::Invalid);
        let text = p.disassemble();
        assert!(text.contains("String Table:"));
        assert!(text.contains("  1: hello"));
        assert!(text.contains("  0: main"));
        assert!(text.contains("    0: PUSHI -7"));
        assert!(text.contains("    5: EXT 1"));
        assert!(text.contains("Imported lib.tern:far"));
        assert!(text.contains("  2: INVALID"));
    }

    #[test]
    fn oversized_local_slot_is_rejected_on_load() {
        let mut p = CompiledProgram::new();
        p.set_function(
            0,
            "main".to_string(),
            FunctionTableEntry::Local(LocalFunction::new(vec![
                Op::bare(Mnemonic::PushUnit),
                Op::new(Mnemonic::SetL, 0xFFFF_FFFF),
                Op::bare(Mnemonic::PushUnit),
                Op::bare(Mnemonic::Retn),
            ])),
        );
        let bytes = p.to_bytes().unwrap();
        assert!(matches!(
            CompiledProgram::from_bytes(&bytes),
            Err(FormatError::TooManyLocals { id: 0, slot: 0xFFFF_FFFF, max: MAX_LOCALS })
        ));
    }

    #[test]
    fn highest_local_slot_loads() {
        let mut p = CompiledProgram::new();
        p.set_function(
            0,
            "main".to_string(),
            FunctionTableEntry::Local(LocalFunction::new(vec![
                Op::new(Mnemonic::GetL, (MAX_LOCALS - 1) as i64),
                Op::bare(Mnemonic::Retn),
            ])),
        );
        let loaded = CompiledProgram::from_bytes(&p.to_bytes().unwrap()).unwrap();
        let FunctionTableEntry::Local(f) = &loaded.functions[0] else { panic!("expected a local") };
        assert_eq!(f.local_count, MAX_LOCALS);
    }
}
