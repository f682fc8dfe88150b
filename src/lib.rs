pub mod app;
pub mod emissions;
pub mod error;
pub mod events;
pub mod handlers;
pub mod history;
pub mod normalize;
pub mod relay;
pub mod rewrite;
pub mod upstream;
