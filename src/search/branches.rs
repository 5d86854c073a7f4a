//! Static branch topology produced by the instrumentation pass.
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt};

use crate::path::BranchId;

use super::Error;

/// Contents of the `branches` file.
///
/// Each function lists its branch pairs `(then, else)`. Function `0` is
/// reserved and owns no branches, so the first function in the file has
/// index `1`.
#[derive(Debug, Clone, Default)]
pub struct BranchTable {
    branches: Vec<BranchId>,
    branch_count: Vec<usize>,
    paired: Vec<BranchId>,
    function: Vec<usize>,
    max_branch: usize,
}

impl BranchTable {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut tokens = text.split_whitespace();
        let mut next = |what: &str| -> Result<Option<i64>, Error> {
            tokens
                .next()
                .map(|t| {
                    t.parse::<i64>()
                        .map_err(|_| Error::BranchTable(format!("expected {}, found `{}`", what, t)))
                })
                .transpose()
        };

        let mut branches = Vec::new();
        let mut branch_count = vec![0];
        let mut max_branch = 0;

        while let Some(fid) = next("a function id")? {
            let pairs = next("a branch count")?
                .ok_or_else(|| Error::BranchTable(format!("function {} has no branch count", fid)))?;
            if pairs < 0 {
                return Err(Error::BranchTable(format!(
                    "function {} has a negative branch count",
                    fid
                )));
            }
            branch_count.push(2 * pairs as usize);

            for _ in 0..2 * pairs {
                let bid = next("a branch id")?.ok_or_else(|| {
                    Error::BranchTable(format!("function {} lists too few branches", fid))
                })?;
                if bid < 0 || bid > i32::MAX as i64 {
                    return Err(Error::BranchTable(format!("branch id {} is out of range", bid)));
                }
                max_branch = max_branch.max(bid as usize);
                branches.push(bid as BranchId);
            }
        }
        let max_branch = max_branch + 1;

        let mut paired = vec![0; max_branch];
        for pair in branches.chunks_exact(2) {
            paired[pair[0] as usize] = pair[1];
            paired[pair[1] as usize] = pair[0];
        }

        let mut function = vec![0; max_branch];
        let mut owned = branches.iter();
        for (fid, count) in branch_count.iter().enumerate() {
            for bid in owned.by_ref().take(*count) {
                function[*bid as usize] = fid;
            }
        }

        Ok(Self {
            branches,
            branch_count,
            paired,
            function,
            max_branch,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Every branch id, pairs adjacent, in file order.
    pub fn branches(&self) -> &[BranchId] {
        &self.branches
    }

    /// One past the largest branch id.
    pub fn max_branch(&self) -> usize {
        self.max_branch
    }

    /// Number of functions, including the reserved function `0`.
    pub fn num_functions(&self) -> usize {
        self.branch_count.len()
    }

    pub fn branch_count(&self, fid: usize) -> usize {
        self.branch_count.get(fid).copied().unwrap_or(0)
    }

    pub fn contains(&self, bid: BranchId) -> bool {
        bid >= 0 && (bid as usize) < self.max_branch
    }

    /// The other side of the `if` that `bid` belongs to.
    pub fn paired(&self, bid: BranchId) -> BranchId {
        if self.contains(bid) {
            self.paired[bid as usize]
        } else {
            bid
        }
    }

    pub fn function_of(&self, bid: BranchId) -> usize {
        if self.contains(bid) {
            self.function[bid as usize]
        } else {
            0
        }
    }
}

/// Successor lists of the `cfg_branches` file, plus the reversed graph.
#[derive(Debug, Clone, Default)]
pub struct CfgTable {
    succs: Vec<Vec<BranchId>>,
    preds: Vec<Vec<BranchId>>,
}

impl CfgTable {
    /// Layout: `u64` branch count, then per branch an `i32` id, a `u64`
    /// successor count and that many `i32` ids, all native endian.
    pub fn parse<R: Read>(mut reader: R, table: &BranchTable) -> Result<Self, Error> {
        let truncated = |e: io::Error| Error::CfgTable(format!("truncated file: {}", e));
        let max_branch = table.max_branch();

        let count = reader.read_u64::<NativeEndian>().map_err(truncated)? as usize;
        if count != table.branches().len() {
            return Err(Error::CfgTable(format!(
                "lists {} branches but the branch table has {}",
                count,
                table.branches().len()
            )));
        }

        let check = |bid: i32| {
            if bid >= 0 && (bid as usize) < max_branch {
                Ok(bid)
            } else {
                Err(Error::CfgTable(format!("branch id {} is out of range", bid)))
            }
        };

        let mut succs = vec![Vec::new(); max_branch];
        for _ in 0..count {
            let src = check(reader.read_i32::<NativeEndian>().map_err(truncated)?)?;
            let len = reader.read_u64::<NativeEndian>().map_err(truncated)? as usize;
            let mut out = Vec::with_capacity(len.min(max_branch));
            for _ in 0..len {
                out.push(check(reader.read_i32::<NativeEndian>().map_err(truncated)?)?);
            }
            succs[src as usize] = out;
        }

        let mut preds = vec![Vec::new(); max_branch];
        for &bid in table.branches() {
            for &succ in &succs[bid as usize] {
                preds[succ as usize].push(bid);
            }
        }

        Ok(Self { succs, preds })
    }

    pub fn from_file<P: AsRef<Path>>(path: P, table: &BranchTable) -> Result<Self, Error> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(Cursor::new(bytes), table)
    }

    pub fn successors(&self, bid: BranchId) -> &[BranchId] {
        self.succs.get(bid as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, bid: BranchId) -> &[BranchId] {
        self.preds.get(bid as usize).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use byteorder::WriteBytesExt;

    use super::*;

    const TABLE: &str = "1 1\n3 4\n2 2\n5 6\n7 8\n";

    #[test]
    fn parse_pairs_and_functions() {
        let table = BranchTable::parse(TABLE).unwrap();
        assert_eq!(table.branches(), &[3, 4, 5, 6, 7, 8]);
        assert_eq!(table.max_branch(), 9);
        assert_eq!(table.num_functions(), 3);
        assert_eq!(table.branch_count(1), 2);
        assert_eq!(table.branch_count(2), 4);
        assert_eq!(table.paired(3), 4);
        assert_eq!(table.paired(8), 7);
        assert_eq!(table.function_of(4), 1);
        assert_eq!(table.function_of(7), 2);
    }

    #[test]
    fn reject_short_table() {
        assert!(matches!(
            BranchTable::parse("1 2\n3 4\n"),
            Err(Error::BranchTable(_))
        ));
        assert!(matches!(
            BranchTable::parse("1 x\n"),
            Err(Error::BranchTable(_))
        ));
    }

    fn cfg_bytes(entries: &[(i32, &[i32])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u64::<NativeEndian>(entries.len() as u64).unwrap();
        for (src, succs) in entries {
            out.write_i32::<NativeEndian>(*src).unwrap();
            out.write_u64::<NativeEndian>(succs.len() as u64).unwrap();
            for s in *succs {
                out.write_i32::<NativeEndian>(*s).unwrap();
            }
        }
        out
    }

    #[test]
    fn cfg_reverse_edges() {
        let table = BranchTable::parse(TABLE).unwrap();
        let bytes = cfg_bytes(&[
            (3, &[5, 6]),
            (4, &[]),
            (5, &[7]),
            (6, &[7]),
            (7, &[]),
            (8, &[]),
        ]);
        let cfg = CfgTable::parse(Cursor::new(bytes), &table).unwrap();
        assert_eq!(cfg.successors(3), &[5, 6]);
        assert_eq!(cfg.predecessors(7), &[5, 6]);
        assert!(cfg.predecessors(3).is_empty());
    }

    #[test]
    fn cfg_count_must_match() {
        let table = BranchTable::parse(TABLE).unwrap();
        let bytes = cfg_bytes(&[(3, &[5])]);
        assert!(matches!(
            CfgTable::parse(Cursor::new(bytes), &table),
            Err(Error::CfgTable(_))
        ));
    }
}
