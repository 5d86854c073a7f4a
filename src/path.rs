use crate::expr::SymExpr;
use crate::value::Location;

pub type BranchId = i32;

/// Pseudo-branch recorded on function entry.
pub const CALL_BRANCH: BranchId = -1;
/// Pseudo-branch recorded on function exit.
pub const RETURN_BRANCH: BranchId = -2;

/// The taken branch sequence plus the symbolic constraints gathered along it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolicPath {
    branches: Vec<BranchId>,
    constraints_idx: Vec<usize>,
    constraints: Vec<SymExpr>,
    locations: Vec<Location>,
}

impl SymbolicPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        branches: Vec<BranchId>,
        constraints_idx: Vec<usize>,
        constraints: Vec<SymExpr>,
        locations: Vec<Location>,
    ) -> Self {
        debug_assert_eq!(constraints_idx.len(), constraints.len());
        debug_assert_eq!(constraints.len(), locations.len());
        Self {
            branches,
            constraints_idx,
            constraints,
            locations,
        }
    }

    pub fn branches(&self) -> &[BranchId] {
        &self.branches
    }

    pub fn constraints(&self) -> &[SymExpr] {
        &self.constraints
    }

    /// Position in [`Self::branches`] of each constraint; strictly increasing.
    pub fn constraints_idx(&self) -> &[usize] {
        &self.constraints_idx
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn push(&mut self, bid: BranchId) {
        self.branches.push(bid);
    }

    /// Record a branch whose outcome depended on `constraint`.
    pub fn push_constraint(&mut self, bid: BranchId, constraint: SymExpr, location: Location) {
        self.constraints.push(constraint);
        self.constraints_idx.push(self.branches.len());
        self.locations.push(location);
        self.branches.push(bid);
    }
}
