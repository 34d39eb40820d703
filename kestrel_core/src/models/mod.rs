// kestrel_core/src/models/mod.rs

//! Sensor models consumed by the solver. The graph core treats these as
//! opaque handles.

pub mod camera;

pub use camera::PinholeCalibration;
