pub mod compress;
pub mod control_plane;
pub mod executor;
pub mod locator;
pub mod planner;
pub mod reporter;
pub mod storage;
