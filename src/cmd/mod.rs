//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled        |
//! |-----------|-------------------------|
//! | `serve`   | `Serve`                 |
//! | `init_db` | `InitDb`                |
//! | `import`  | `Import`, `Importers`   |
//! | `config`  | `Config`                |

pub mod config;
pub mod import;
pub mod init_db;
pub mod serve;

pub use config::cmd_config;
pub use import::{cmd_import, cmd_importers};
pub use init_db::cmd_init_db;
pub use serve::cmd_serve;
