use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot access memory at 0x{addr:x} ({len} bytes)")]
    Memory { addr: u64, len: usize },

    #[error("register error: {0}")]
    Register(String),

    #[error("malformed unwind section {section}: {reason}")]
    UnwindSection { section: String, reason: String },

    #[error("cannot read instruction at 0x{0:x}")]
    Instruction(u64),

    /// No helper to route an inferior call through; names the helpers
    /// that were looked for.
    #[error(
        "cannot find an address for {0} trampoline\n\
         Suggest linking executable with -g or compiling with gcc."
    )]
    MissingTrampoline(&'static str),

    #[error("cannot build a call stub for 0x{0:x}: address does not fit in 32 bits")]
    StubOutOfRange(u64),

    #[error("object file error: {0}")]
    Object(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
