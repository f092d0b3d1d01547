mod dir_list;
mod handle_table;
mod io_engine;
mod lock_mgr;
mod path_translate;
mod root_table;
mod session;

pub use dir_list::DirCursor;
pub use handle_table::{HandleEntry, HandleIo, HandleKind, HandleTable};
pub use lock_mgr::{LockManager, LockRecord};
pub use path_translate::{translate, MAX_HOST_PATH_BYTES};
pub use root_table::{RootConfig, RootEntry, RootTable};
pub use session::{ClientSession, Redirector, RedirectorService};

#[cfg(test)]
mod service_tests;
