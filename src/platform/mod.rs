//! Project and task service around the bulk importers.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ ImportDispatcher::dispatch_import()    │
//!                       │         v                                        │
//!                       │  jobs.rs  (threshold, mpsc queue, workers,       │
//!                       │            recovery, autoimport scheduler)       │
//!                       │         │                                        │
//!                       │         │ Importer::create_tasks()               │
//!                       │         v                                        │
//!                       │  crate::importers  (source adapters)             │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                          |
//! |-----------|---------------------------------------------------------|
//! | `models`  | Shared types: `Project`, `Task`, `ImportJob`            |
//! | `db`      | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `ws`      | `EventMessage` enum + `broadcast_event()` helper        |
//! | `export`  | CSV / JSON task export                                  |
//!
//! ## Import Flow
//!
//! 1. `POST /api/projects/{short_name}/tasks/import` with an `ImportForm`.
//! 2. `dispatch_import` asks the importer for a task count.
//! 3. At or below `max_synchronous_tasks` the rows are saved inline and the
//!    response is `200` with the result message.
//! 4. Above it, an `ImportJob` row is written, its id goes on the queue and
//!    the response is `202`. A worker later moves the job through
//!    `running` to `completed` or `failed`, broadcasting each step.

pub mod api;
pub mod db;
pub mod export;
pub mod jobs;
pub mod models;
pub mod server;
pub mod ws;
