pub mod audit_trail;
pub mod cloud_store;
pub mod local_store;
pub mod presence;
pub mod router;
pub mod store;
pub mod sync;
