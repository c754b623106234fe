//! Charger groups
//!
//! Groups form a tree via parent ids. A group with a `max_allocation`
//! schedule is an *allocation group*: it owns the chargers below it for
//! which it is the nearest such ancestor, and its schedule bounds their
//! combined offers.

use crate::model::schedule::Schedule;

#[derive(Debug, Clone)]
pub struct Group {
    pub group_id: String,
    pub parent_id: Option<String>,
    pub description: Option<String>,
    /// Default session priority for chargers under this group.
    pub priority: Option<i32>,
    pub max_allocation: Option<Schedule>,
    /// Admin-requested freeze of the allocator for this subtree.
    pub allocator_suspended: bool,
}

impl Group {
    pub fn new(
        group_id: impl Into<String>,
        parent_id: Option<String>,
        description: Option<String>,
        priority: Option<i32>,
        max_allocation: Option<Schedule>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            parent_id,
            description,
            priority,
            max_allocation,
            allocator_suspended: false,
        }
    }

    pub fn is_allocation_group(&self) -> bool {
        self.max_allocation.is_some()
    }
}
