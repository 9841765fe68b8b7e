/*!
  Instruction encoding and the compiled program container.

  An instruction is a single 64-bit word: the opcode in the top byte and a
  56-bit payload below it. A compiled program is a string table, a function
  table and a name → function-id table, written to disk as:

  ```text
  magic    "TRN01"                      5 bytes
  strings  count:i32 { len:i32 bytes }*
  names    count:i32 { id:i32 len:i32 bytes }*
  bodies   { kind:u8 body }*            one per name, in table order
           kind 0x01 local:    count:i32 { word:i64 }*
           kind 0x02 imported: len:i32 file  len:i32 name
  ```

  All integers are big-endian.
*/

mod op;
mod program;

pub use op::{Mnemonic, Op, DATA_MASK};
pub use program::{
    CompiledProgram, FunctionTableEntry, LocalFunction, ProgramScaffolding, MAGIC, MAX_FILE_SIZE,
    MAX_LOCALS,
};

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid program format: unexpected magic {found:?}")]
    BadMagic { found: Vec<u8> },
    #[error("invalid program format: negative {what} length {len} at offset {offset}")]
    NegativeLength { what: &'static str, len: i32, offset: usize },
    #[error("invalid program format: unknown function kind {marker:#04x} at offset {offset}")]
    UnknownFunctionKind { marker: u8, offset: usize },
    #[error("invalid program format: unknown opcode {code}")]
    UnknownOpcode { code: u8 },
    #[error("invalid program format: unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },
    #[error("invalid program format: string at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },
    #[error("invalid program format: function id {id} is outside the function table")]
    FunctionIdOutOfRange { id: i32 },
    #[error("invalid program format: function {id} addresses local slot {slot}, the limit is {max}")]
    TooManyLocals { id: usize, slot: usize, max: usize },
    #[error("invalid program format: file is {size} bytes, the limit is {max}")]
    FileTooLarge { size: u64, max: u64 },
    #[error("cannot save program: function table has {functions} entries but name table has {names}")]
    TableMismatch { functions: usize, names: usize },
    #[error("cannot save program: function table entry {id} was never set")]
    InvalidEntry { id: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
