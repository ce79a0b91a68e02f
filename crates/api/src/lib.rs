//! Bridge binary support: service wiring and the HTTP query surface.

pub mod app;
