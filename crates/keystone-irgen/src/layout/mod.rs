//! Metadata record layout: plan, scanner and per-session cache

pub mod cache;
pub mod plan;
pub mod scanner;

pub use cache::LayoutCache;
pub use plan::{walk, HeaderSlot, LayoutPlan, LayoutStep, LayoutVisitor};
pub use scanner::{MemberRange, MetadataLayout, SlotInfo, SlotName, StoredOffset};
