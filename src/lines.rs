use std::mem;

/// Byte terminating every line. No carriage return handling is done.
pub const LINE_SEPARATOR: u8 = b'\n';

/// Turns read chunks into blocks of complete lines.
///
/// Bytes after the last separator seen so far are held in a continuation buffer until a later chunk terminates them.
/// Each call to `push` yields at most one block: everything up to the last separator of the chunk, prefixed with the
/// held bytes and without that final separator. A block may still contain inner separators; `split_block` breaks it
/// into lines.
///
/// ```rust
/// # use filetrail::lines::{LineAssembler, split_block};
/// let mut assembler = LineAssembler::new();
/// let block = assembler.push(b"a\nb\nc").unwrap();
/// assert_eq!(split_block(&block).collect::<Vec<_>>(), vec![&b"a"[..], &b"b"[..]]);
/// assert_eq!(assembler.pending(), b"c");
/// assert_eq!(assembler.push(b"d\n").unwrap(), b"cd");
/// ```
#[derive(Debug, Default, Clone)]
pub struct LineAssembler {
    continuation: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns `None` if the chunk completes no line.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        let split_at = chunk.iter().rposition(|&b| b == LINE_SEPARATOR);
        let Some(split_at) = split_at else {
            self.continuation.extend_from_slice(chunk);
            return None;
        };
        let mut block = mem::take(&mut self.continuation);
        block.extend_from_slice(&chunk[..split_at]);
        // a chunk ending on the separator leaves nothing behind, not an empty line
        self.continuation.extend_from_slice(&chunk[split_at + 1..]);
        Some(block)
    }

    /// Bytes of the line that is not terminated yet
    pub fn pending(&self) -> &[u8] {
        &self.continuation
    }

    /// Hand out the unterminated tail, leaving the assembler empty
    pub fn take_pending(&mut self) -> Option<Vec<u8>> {
        if self.continuation.is_empty() {
            return None;
        }
        Some(mem::take(&mut self.continuation))
    }

    /// Drop the unterminated tail, returning how many bytes were discarded
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.continuation.len();
        self.continuation.clear();
        discarded
    }
}

/// Lines of a block produced by `LineAssembler::push`
pub fn split_block(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block.split(|&b| b == LINE_SEPARATOR)
}
