use std::collections::HashMap;

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

/// Size of one serialized detour record.
pub const DETOUR_RECORD_SIZE: usize = 256;

const FIELD_TYPE_DETOUR: i32 = 0;

/// Override record from a `GSIC` wrapper: a function replaced at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detour {
    pub name: u64,
    pub fixup_offset: u32,
    pub fixup_size: u32,
    pub replace_namespace: u32,
    pub replace_function: u32,
    pub replace_script: u64,
}

/// Parsed wrapper state: header size to strip plus the detour index keyed by
/// the code offset each detour replaces.
#[derive(Debug, Default, Clone)]
pub struct GsicInfo {
    pub is_gsic: bool,
    pub header_size: usize,
    pub detours: HashMap<u32, Detour>,
}

pub fn is_gsic(data: &[u8]) -> bool {
    data.len() > 4 && &data[..4] == b"GSIC"
}

/// Parse the wrapper preceding a script blob. Layout: `'GSIC'`, i32 field
/// count, then per field an i32 type. Type 0 is a detour list: i32 count then
/// fixed-size records.
pub fn parse(data: &[u8]) -> Result<GsicInfo> {
    let mut info = GsicInfo {
        is_gsic: true,
        ..Default::default()
    };
    let mut pos = 4usize;

    let num_fields = read_i32(data, &mut pos)?;
    debug!("reading GSIC wrapper, {} field(s)", num_fields);

    for _ in 0..num_fields {
        let field_type = read_i32(data, &mut pos)?;
        match field_type {
            FIELD_TYPE_DETOUR => {
                let count = read_i32(data, &mut pos)?;
                if count < 0 {
                    bail!("negative GSIC detour count: {}", count);
                }
                for _ in 0..count {
                    if pos + DETOUR_RECORD_SIZE > data.len() {
                        bail!("truncated GSIC detour record at {:#x}", pos);
                    }
                    let rec = &data[pos..pos + DETOUR_RECORD_SIZE];
                    let detour = Detour {
                        name: LittleEndian::read_u64(&rec[0..8]),
                        fixup_offset: LittleEndian::read_u32(&rec[8..12]),
                        fixup_size: LittleEndian::read_u32(&rec[12..16]),
                        replace_namespace: LittleEndian::read_u32(&rec[16..20]),
                        replace_function: LittleEndian::read_u32(&rec[20..24]),
                        replace_script: LittleEndian::read_u64(&rec[28..36]),
                    };
                    info.detours.insert(detour.fixup_offset, detour);
                    pos += DETOUR_RECORD_SIZE;
                }
            }
            other => bail!("bad GSIC field type: {}", other),
        }
    }

    info.header_size = pos;
    Ok(info)
}

fn read_i32(data: &[u8], pos: &mut usize) -> Result<i32> {
    if *pos + 4 > data.len() {
        bail!("truncated GSIC header at {:#x}", *pos);
    }
    let v = LittleEndian::read_i32(&data[*pos..*pos + 4]);
    *pos += 4;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapper_with_one_detour() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"GSIC");
        data.extend_from_slice(&1i32.to_le_bytes()); // field count
        data.extend_from_slice(&0i32.to_le_bytes()); // detour field
        data.extend_from_slice(&1i32.to_le_bytes()); // detour count
        let mut rec = [0u8; DETOUR_RECORD_SIZE];
        rec[0..8].copy_from_slice(&0x1122u64.to_le_bytes());
        rec[8..12].copy_from_slice(&0x80u32.to_le_bytes());
        rec[12..16].copy_from_slice(&0x10u32.to_le_bytes());
        rec[16..20].copy_from_slice(&0xAAu32.to_le_bytes());
        rec[20..24].copy_from_slice(&0xBBu32.to_le_bytes());
        rec[28..36].copy_from_slice(&0xCCDDu64.to_le_bytes());
        data.extend_from_slice(&rec);
        data
    }

    #[test]
    fn parses_detour_list() {
        let data = wrapper_with_one_detour();
        assert!(is_gsic(&data));
        let info = parse(&data).unwrap();
        assert_eq!(info.header_size, data.len());
        assert_eq!(info.detours.len(), 1);
        let d = &info.detours[&0x80];
        assert_eq!(d.name, 0x1122);
        assert_eq!(d.replace_function, 0xBB);
        assert_eq!(d.replace_script, 0xCCDD);
    }

    #[test]
    fn rejects_unknown_field_type() {
        let mut data = Vec::new();
        data.extend_from_slice(b"GSIC");
        data.extend_from_slice(&1i32.to_le_bytes());
        data.extend_from_slice(&7i32.to_le_bytes());
        assert!(parse(&data).is_err());
    }

    #[test]
    fn rejects_truncated_record() {
        let mut data = wrapper_with_one_detour();
        data.truncate(data.len() - 10);
        assert!(parse(&data).is_err());
    }
}
