pub mod events;
pub mod presets;
pub mod session;
