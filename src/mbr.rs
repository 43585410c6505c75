// vim: tw=80
//! Master boot record builder: renders a config `mbr` section into a
//! 512-byte buffer (spec §3 "MBR image", §4.2 `mbr_write`).

use crate::{
    config::Section,
    error::{FwupError, Result},
};

const SECTORS_PER_TRACK: u32 = 63;
const HEADS_PER_CYLINDER: u32 = 255;

/// A 3-byte CHS address, derived from an LBA block offset.
///
/// Grounded on the standard CHS-from-LBA translation (63 sectors/track,
/// 255 heads/cylinder); values that don't fit saturate to the
/// traditional "out of range" sentinel `0xFE 0xFF 0xFF` rather than
/// wrapping, since CHS is vestigial on any device this tool targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chs([u8; 3]);

impl Chs {
    pub const OUT_OF_RANGE: Chs = Chs([0xFE, 0xFF, 0xFF]);

    pub fn from_lba(lba: u32) -> Self {
        let cylinder = lba / (SECTORS_PER_TRACK * HEADS_PER_CYLINDER);
        if cylinder > 0x3FF {
            return Self::OUT_OF_RANGE;
        }
        let rem = lba % (SECTORS_PER_TRACK * HEADS_PER_CYLINDER);
        let head = rem / SECTORS_PER_TRACK;
        let sector = rem % SECTORS_PER_TRACK + 1;
        Chs([
            (head & 0xFF) as u8,
            (sector & 0x3F) as u8 | (((cylinder & 0x300) >> 2) as u8),
            (cylinder & 0xFF) as u8,
        ])
    }

    pub fn to_bytes(self) -> [u8; 3] {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Partition {
    pub boot: bool,
    pub part_type: u8,
    pub block_offset: u32,
    pub block_count: u32,
}

impl Partition {
    pub fn is_empty(&self) -> bool {
        self.part_type == 0 && self.block_count == 0
    }

    /// Parses one 16-byte partition table entry back out of a rendered
    /// MBR, the inverse of [`Partition::write_entry`]. Used by task
    /// preconditions (`require-partition-offset`) to inspect whichever
    /// image is already on the target device.
    fn read_entry(raw: &[u8]) -> Self {
        debug_assert_eq!(raw.len(), 16);
        Partition {
            boot: raw[0] == 0x80,
            part_type: raw[4],
            block_offset: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            block_count: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
        }
    }

    fn write_entry(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), 16);
        out[0] = if self.boot { 0x80 } else { 0x00 };
        if self.is_empty() {
            out[1..16].fill(0);
            return;
        }
        out[1..4].copy_from_slice(&Chs::from_lba(self.block_offset).to_bytes());
        out[4] = self.part_type;
        out[5..8].copy_from_slice(
            &Chs::from_lba(self.block_offset.saturating_add(self.block_count).saturating_sub(1))
                .to_bytes(),
        );
        out[8..12].copy_from_slice(&self.block_offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.block_count.to_le_bytes());
    }
}

pub struct Mbr {
    pub bootstrap: [u8; 440],
    pub disk_signature: u32,
    pub partitions: [Partition; 4],
}

impl Default for Mbr {
    fn default() -> Self {
        Mbr { bootstrap: [0u8; 440], disk_signature: 0, partitions: Default::default() }
    }
}

impl Mbr {
    /// Parses a config `mbr "name" { ... }` section into a renderable
    /// image, loading the bootstrap code from the host filesystem if the
    /// section names one.
    pub fn from_config(section: &Section) -> Result<Self> {
        let mut mbr = Mbr::default();
        if let Some(path) = section.get("bootstrap-code-host-path") {
            let bytes = std::fs::read(path)
                .map_err(|e| FwupError::io(format!("reading bootstrap code {path}: {e}")))?;
            if bytes.len() > mbr.bootstrap.len() {
                return Err(FwupError::format(format!(
                    "bootstrap code is {} bytes, must be at most {}",
                    bytes.len(),
                    mbr.bootstrap.len()
                )));
            }
            mbr.bootstrap[..bytes.len()].copy_from_slice(&bytes);
        }
        if let Some(sig) = section.get("signature") {
            mbr.disk_signature = crate::config::parse_cint(sig)
                .ok_or_else(|| FwupError::config("mbr signature is not a valid integer"))?
                as u32;
        }
        for part_section in section.children("partition") {
            let idx: usize = part_section
                .name
                .as_deref()
                .ok_or_else(|| FwupError::config("partition block needs a numeric index"))?
                .parse()
                .map_err(|_| FwupError::config("partition index is not a number"))?;
            if idx >= 4 {
                return Err(FwupError::config(format!(
                    "partition index {idx} out of range (MBR supports 0..=3)"
                )));
            }
            mbr.partitions[idx] = Partition {
                boot: part_section.get_bool("boot")?,
                part_type: part_section.get_u64_or("type", 0)? as u8,
                block_offset: part_section.get_u64("block-offset")? as u32,
                block_count: part_section.get_u64("block-count")? as u32,
            };
        }
        Ok(mbr)
    }

    /// Renders the full 512-byte image: bootstrap, signature, reserved,
    /// four partition entries, and the `0x55 0xAA` boot signature.
    pub fn render(&self) -> [u8; 512] {
        let mut out = [0u8; 512];
        out[0..440].copy_from_slice(&self.bootstrap);
        out[440..444].copy_from_slice(&self.disk_signature.to_le_bytes());
        // out[444..446] reserved, left zero.
        for (i, part) in self.partitions.iter().enumerate() {
            part.write_entry(&mut out[446 + i * 16..446 + (i + 1) * 16]);
        }
        out[510] = 0x55;
        out[511] = 0xAA;
        out
    }

    /// Parses an existing 512-byte MBR image back into partition entries
    /// (bootstrap code and signature are not reconstructed, task
    /// preconditions only ever inspect partitions). Used by
    /// `require-partition-offset` to read whichever image is currently
    /// on the target device before picking a task.
    pub fn partition(raw: &[u8; 512], idx: usize) -> Result<Partition> {
        if idx >= 4 {
            return Err(FwupError::validation(
                "require-partition-offset",
                format!("partition index {idx} out of range (MBR supports 0..=3)"),
            ));
        }
        if raw[510] != 0x55 || raw[511] != 0xAA {
            return Err(FwupError::format("not a valid MBR: missing 0x55 0xAA signature"));
        }
        Ok(Partition::read_entry(&raw[446 + idx * 16..446 + (idx + 1) * 16]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_boot_signature_and_layout() {
        let mbr = Mbr::default();
        let img = mbr.render();
        assert_eq!(img.len(), 512);
        assert_eq!(&img[510..512], &[0x55, 0xAA]);
    }

    #[test]
    fn four_partitions_land_at_expected_offsets() {
        let mut mbr = Mbr::default();
        mbr.bootstrap[0] = 0xEB;
        for i in 0..4u32 {
            mbr.partitions[i as usize] = Partition {
                boot: i == 0,
                part_type: 0x83,
                block_offset: 2048 * (i + 1),
                block_count: 2048,
            };
        }
        let img = mbr.render();
        assert_eq!(&img[0..440], &mbr.bootstrap[..]);
        for i in 0..4usize {
            let entry = &img[446 + i * 16..446 + (i + 1) * 16];
            assert_eq!(entry[0], if i == 0 { 0x80 } else { 0x00 });
            assert_eq!(entry[4], 0x83);
            let off = u32::from_le_bytes(entry[8..12].try_into().unwrap());
            let count = u32::from_le_bytes(entry[12..16].try_into().unwrap());
            assert_eq!(off, 2048 * (i as u32 + 1));
            assert_eq!(count, 2048);
        }
        assert_eq!(&img[510..512], &[0x55, 0xAA]);
    }

    #[test]
    fn partition_round_trips_through_render() {
        let mut mbr = Mbr::default();
        mbr.partitions[2] = Partition { boot: true, part_type: 0x83, block_offset: 2048, block_count: 524288 };
        let img = mbr.render();
        let part = Mbr::partition(&img, 2).unwrap();
        assert_eq!(part.block_offset, 2048);
        assert_eq!(part.block_count, 524288);
        assert!(part.boot);
        assert_eq!(part.part_type, 0x83);
    }

    #[test]
    fn partition_rejects_missing_boot_signature() {
        let img = [0u8; 512];
        assert!(Mbr::partition(&img, 0).is_err());
    }

    #[test]
    fn chs_out_of_range_saturates() {
        let chs = Chs::from_lba(u32::MAX);
        assert_eq!(chs, Chs::OUT_OF_RANGE);
    }
}
