pub mod dispatch;
pub mod state;
pub mod worker;

pub use state::AppState;
