//! Typed ID definitions for the execution plane.

use crate::define_id;

// =============================================================================
// Scheduling Entities
// =============================================================================

define_id!(TaskId, "task");
define_id!(GroupId, "grp");
define_id!(AgentId, "agt");
define_id!(AllocationId, "alloc");
