pub mod alarm;
pub mod api;
pub mod audio;
pub mod clock;
pub mod notify;
pub mod presenter;
pub mod sounds;
