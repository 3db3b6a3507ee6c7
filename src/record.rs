/// RecordId represents a record's location in a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub file_id: u64,
    pub file_offset: u64,
    pub len: u64,
}

impl RecordId {
    pub fn new(file_id: u64, file_offset: u64, len: u64) -> Self {
        Self {
            file_id,
            file_offset,
            len,
        }
    }

    /// Offset of the first byte after this record.
    pub fn end(&self) -> u64 {
        self.file_offset + self.len
    }
}
