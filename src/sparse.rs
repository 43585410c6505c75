// vim: tw=80
//! Sparse file map: an alternating run-length description of a resource's
//! data and holes (spec §3, §4.5).

use crate::{config::Section, error::{FwupError, Result}};

/// Ordered run lengths, beginning with a data run. Even-indexed runs are
/// data bytes present in the archive; odd-indexed runs are holes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SparseMap {
    runs: Vec<u64>,
}

impl SparseMap {
    /// A single dense (non-sparse) resource of `len` bytes.
    pub fn dense(len: u64) -> Self {
        SparseMap { runs: vec![len] }
    }

    /// Builds a map from an explicit run-length list (e.g. as stored in
    /// the manifest), validating it is well-formed.
    pub fn from_runs(runs: Vec<u64>) -> Result<Self> {
        if runs.is_empty() {
            return Err(FwupError::config("sparse map must have at least one run"));
        }
        Ok(SparseMap { runs })
    }

    pub fn runs(&self) -> &[u64] {
        &self.runs
    }

    /// Sum of the data (even-indexed) runs.
    pub fn data_size(&self) -> u64 {
        self.runs.iter().step_by(2).sum()
    }

    /// Sum of all runs, data and holes.
    pub fn total_size(&self) -> u64 {
        self.runs.iter().sum()
    }

    /// The length of the trailing hole, if the run list ends on one.
    pub fn ending_hole(&self) -> u64 {
        if self.runs.len() % 2 == 0 {
            *self.runs.last().unwrap()
        } else {
            0
        }
    }

    /// Maps a byte offset in the resource's *data* stream (as yielded by
    /// [`crate::stream::ResourceStream`]) to the corresponding destination
    /// offset, accounting for any holes that precede it. Returns `None`
    /// past `data_size()`.
    pub fn dest_offset_for(&self, data_offset: u64) -> Option<u64> {
        let mut data_cum = 0u64;
        for (dest, data_len, _hole) in self.data_runs() {
            if data_offset < data_cum + data_len {
                return Some(dest + (data_offset - data_cum));
            }
            data_cum += data_len;
        }
        None
    }

    /// The data-offset at which the data run containing `data_offset`
    /// ends (i.e. where the next hole, if any, begins). Used to split a
    /// stream chunk that would otherwise straddle a hole.
    pub fn run_end_for(&self, data_offset: u64) -> u64 {
        let mut data_cum = 0u64;
        for (_dest, data_len, _hole) in self.data_runs() {
            if data_offset < data_cum + data_len {
                return data_cum + data_len;
            }
            data_cum += data_len;
        }
        data_offset
    }

    /// Builds a resource's sparse map from its `file-resource` manifest
    /// section: the `sparse-runs` key (a comma-separated run-length list,
    /// written by `create` when the host file has holes) if present,
    /// otherwise a single dense run covering the declared `length` (spec
    /// §3 "Sparse file map", SPEC_FULL §3 "file-resource").
    pub fn from_config(section: &Section) -> Result<Self> {
        match section.get("sparse-runs") {
            Some(csv) => {
                let runs = csv
                    .split(',')
                    .map(|s| {
                        crate::config::parse_cint(s.trim()).ok_or_else(|| {
                            FwupError::config(format!("malformed sparse-runs entry `{s}`"))
                        })
                    })
                    .collect::<Result<Vec<u64>>>()?;
                SparseMap::from_runs(runs)
            }
            None => Ok(SparseMap::dense(section.get_u64("length")?)),
        }
    }

    /// Yields `(data_offset, hole_len)` pairs: for each data run, the byte
    /// offset (in destination space) at which it begins, and the length of
    /// hole that immediately follows it (0 for the final run if it is
    /// data, i.e. there is no ending hole).
    pub fn data_runs(&self) -> Vec<(u64, u64, u64)> {
        // (dest_offset, data_len, following_hole_len)
        let mut out = Vec::new();
        let mut offset = 0u64;
        let mut i = 0;
        while i < self.runs.len() {
            let data_len = self.runs[i];
            let hole_len = self.runs.get(i + 1).copied().unwrap_or(0);
            out.push((offset, data_len, hole_len));
            offset += data_len + hole_len;
            i += 2;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_map_has_no_holes() {
        let m = SparseMap::dense(100);
        assert_eq!(m.data_size(), 100);
        assert_eq!(m.total_size(), 100);
        assert_eq!(m.ending_hole(), 0);
    }

    #[test]
    fn sparse_map_with_ending_hole() {
        // 4 KiB of data followed by a 1 MiB hole.
        let m = SparseMap::from_runs(vec![4096, 1048576]).unwrap();
        assert_eq!(m.data_size(), 4096);
        assert_eq!(m.total_size(), 4096 + 1048576);
        assert_eq!(m.ending_hole(), 1048576);
        assert_eq!(m.data_runs(), vec![(0, 4096, 1048576)]);
    }

    #[test]
    fn sparse_map_ending_in_data() {
        let m = SparseMap::from_runs(vec![100, 50, 200]).unwrap();
        assert_eq!(m.data_size(), 300);
        assert_eq!(m.total_size(), 350);
        assert_eq!(m.ending_hole(), 0);
        assert_eq!(m.data_runs(), vec![(0, 100, 50), (150, 200, 0)]);
    }

    #[test]
    fn rejects_empty_run_list() {
        assert!(SparseMap::from_runs(vec![]).is_err());
    }

    #[test]
    fn from_config_prefers_sparse_runs_over_length() {
        let cfg = crate::config::Config::parse(
            r#"file-resource "r" { length = "10"; sparse-runs = "4096, 1048576"; }"#,
        )
        .unwrap();
        let section = cfg.section("file-resource", "r").unwrap();
        let m = SparseMap::from_config(section).unwrap();
        assert_eq!(m.data_size(), 4096);
        assert_eq!(m.ending_hole(), 1048576);
    }

    #[test]
    fn from_config_falls_back_to_dense_length() {
        let cfg = crate::config::Config::parse(r#"file-resource "r" { length = "42"; }"#).unwrap();
        let section = cfg.section("file-resource", "r").unwrap();
        let m = SparseMap::from_config(section).unwrap();
        assert_eq!(m.data_size(), 42);
        assert_eq!(m.ending_hole(), 0);
    }

    #[test]
    fn dest_offset_skips_holes() {
        // 100 bytes data, 50-byte hole, 200 bytes data.
        let m = SparseMap::from_runs(vec![100, 50, 200]).unwrap();
        assert_eq!(m.dest_offset_for(0), Some(0));
        assert_eq!(m.dest_offset_for(99), Some(99));
        // The 100th data byte (index 100) lands after the hole.
        assert_eq!(m.dest_offset_for(100), Some(150));
        assert_eq!(m.dest_offset_for(299), Some(349));
        assert_eq!(m.dest_offset_for(300), None);
        assert_eq!(m.run_end_for(0), 100);
        assert_eq!(m.run_end_for(150), 300);
    }
}
