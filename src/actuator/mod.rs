//! Drive actuator collaborator
//!
//! The orchestrator only ever talks to [`Actuator`]; the serial motor
//! controller behind it is [`UartActuator`].

use async_trait::async_trait;

use crate::error::Result;

pub mod uart;

pub use uart::UartActuator;

/// Throttle bound forwarded to the actuator
pub const THROTTLE_LIMIT: i32 = 500;
/// Steering bound forwarded to the actuator
pub const STEER_LIMIT: i32 = 1000;

/// Clamp raw control axes into the actuator's safe range
pub fn clamp_axes(throttle: i32, steer: i32) -> (i32, i32) {
    (
        throttle.clamp(-THROTTLE_LIMIT, THROTTLE_LIMIT),
        steer.clamp(-STEER_LIMIT, STEER_LIMIT),
    )
}

/// Actuator trait.
///
/// Implementations must be callable from the async event loop without
/// blocking it.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Get actuator name
    fn name(&self) -> &'static str;

    /// Whether commands can currently reach the device
    fn is_connected(&self) -> bool;

    /// Send one control command
    async fn send_command(&self, throttle: i32, steer: i32) -> Result<()>;

    /// Bring the device to rest and release it
    async fn stop(&self) -> Result<()>;
}
