pub mod config;
pub mod file_naming;
pub mod fs_view;
pub mod model;
pub mod storage;
pub mod timeline;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use fs_view::FileSystemView;
pub use storage::TableStorage;
pub use timeline::Timeline;
