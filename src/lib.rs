mod dedupfs_lib;

pub use dedupfs_lib::*;
