pub mod cache;
pub mod capture;
pub mod compile;
pub mod engine;
pub mod guest;
pub mod invoke;
pub mod io;
pub mod marshal;
pub mod resource;
pub mod state;
