use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};

/// Sidecar index mapping code offsets to encoded opcodes, used for
/// cross-version opcode analysis. Owned by the run, not process-global, so
/// parallel front-ends can keep their own sink.
#[derive(Default)]
pub struct RosettaSink {
    enabled: bool,
    blocks: BTreeMap<u64, RosettaFile>,
    current: u64,
}

struct RosettaFile {
    /// Clone of the script header, taken before link patching.
    header: Vec<u8>,
    ops: Vec<(u32, u16)>,
}

impl RosettaSink {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Begin a file block keyed by the script name hash.
    pub fn start_file(&mut self, name: u64, header: &[u8]) {
        if !self.enabled {
            return;
        }
        self.current = name;
        self.blocks.insert(
            name,
            RosettaFile {
                header: header.to_vec(),
                ops: Vec::new(),
            },
        );
    }

    pub fn add_opcode(&mut self, location: u32, opcode: u16) {
        if !self.enabled {
            return;
        }
        if let Some(block) = self.blocks.get_mut(&self.current) {
            block.ops.push((location, opcode));
        }
    }

    pub fn add_opcodes(&mut self, ops: &[(u32, u16)]) {
        for &(location, opcode) in ops {
            self.add_opcode(location, opcode);
        }
    }

    /// Serialize: `'ROSE'`, u64 block count, per block the header bytes, a
    /// u64 record count and `(u32 location, u16 opcode)` records, then
    /// `'END'`.
    // TODO: add a crc once the format is versioned
    pub fn write(&self, out: &mut dyn Write) -> Result<()> {
        out.write_all(b"ROSE").context("write rosetta preamble")?;
        out.write_all(&(self.blocks.len() as u64).to_le_bytes())?;
        for block in self.blocks.values() {
            out.write_all(&block.header)?;
            out.write_all(&(block.ops.len() as u64).to_le_bytes())?;
            for &(location, opcode) in &block.ops {
                out.write_all(&location.to_le_bytes())?;
                out.write_all(&opcode.to_le_bytes())?;
            }
        }
        out.write_all(b"END").context("write rosetta trailer")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sink_records_nothing() {
        let mut sink = RosettaSink::new(false);
        sink.start_file(1, &[0u8; 4]);
        sink.add_opcode(0, 0x42);
        let mut out = Vec::new();
        sink.write(&mut out).unwrap();
        // preamble + zero count + trailer
        assert_eq!(out.len(), 4 + 8 + 3);
    }

    #[test]
    fn serializes_blocks_in_order() {
        let mut sink = RosettaSink::new(true);
        sink.start_file(2, &[0xAA; 8]);
        sink.add_opcode(0x10, 0x0B16);
        sink.start_file(1, &[0xBB; 8]);
        sink.add_opcode(0x20, 0x0001);
        let mut out = Vec::new();
        sink.write(&mut out).unwrap();

        assert_eq!(&out[..4], b"ROSE");
        assert_eq!(u64::from_le_bytes(out[4..12].try_into().unwrap()), 2);
        // blocks ordered by name hash: 1 before 2
        assert_eq!(&out[12..20], &[0xBB; 8]);
        assert_eq!(&out[out.len() - 3..], b"END");
    }
}
