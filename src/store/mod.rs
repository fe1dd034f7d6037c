pub mod db;
pub mod events;

pub use db::Db;
pub use events::{event_id, EventStore};
