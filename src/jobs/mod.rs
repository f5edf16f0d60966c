pub mod identity_cache;
pub mod registry_refresh;
