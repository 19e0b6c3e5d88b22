//! Sea-ORM entity definitions

pub mod child_record;
pub mod main_record;
pub mod sync_history;
pub mod sync_status;
pub mod unified_record;

pub use child_record::Entity as ChildRecord;
pub use main_record::Entity as MainRecord;
pub use sync_history::Entity as SyncHistory;
pub use sync_status::Entity as SyncStatusEntity;
pub use unified_record::Entity as UnifiedRecord;

pub use sync_status::{SyncStatus, SyncType};
