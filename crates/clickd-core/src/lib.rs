mod config;
mod error;
mod wire;

pub use config::{
    parse_extra_db_roots, set_default_path_env, ServiceConfig, DEFAULT_DB_ROOT, DEFAULT_PATH,
    DEFAULT_SOCKET_PATH, TEST_DB_PATHS_ENV,
};
pub use error::ServiceError;
pub use wire::{ErrorKind, Request, Response};
