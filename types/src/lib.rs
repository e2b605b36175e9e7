pub mod conf;
pub mod dag;
pub mod engine;
pub mod federation;
pub mod job;
pub mod party;
pub mod status;
pub mod task;

pub use conf::*;
pub use engine::*;
pub use federation::*;
pub use job::*;
pub use party::*;
pub use status::*;
pub use task::*;
