//! NAT classification, plan synthesis, and the hole-punch engine.

pub mod analyze;
pub mod detect;
pub mod engine;
pub mod stun;
pub mod tools;

pub use analyze::{analyze, Action, AnalyzeResult, Resource, Role};
pub use detect::{detect, DetectResult, Server};
pub use engine::{make_hole, nat_from_analyze, Nat};
pub use stun::{analyze_stun_behavior, filter_tests, mapping_tests, Behavior, StunBehavior};
