//! Remote-input events carried on the controller side-channel.
//!
//! The coordinator only parses and validates these; injecting them into the
//! host OS is the display agent's concern.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InputModifiers {
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub meta: bool,
}

/// One input event from the controller client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputEvent {
    #[serde(rename = "mousemove")]
    MouseMove { x: f64, y: f64 },
    #[serde(rename = "mousedown")]
    MouseDown { x: f64, y: f64, button: u8 },
    #[serde(rename = "mouseup")]
    MouseUp { x: f64, y: f64, button: u8 },
    #[serde(rename_all = "camelCase")]
    Wheel {
        #[serde(default)]
        delta_x: f64,
        #[serde(default)]
        delta_y: f64,
    },
    #[serde(rename = "keydown")]
    KeyDown {
        key: String,
        code: String,
        #[serde(default)]
        modifiers: InputModifiers,
    },
    #[serde(rename = "keyup")]
    KeyUp {
        key: String,
        code: String,
        #[serde(default)]
        modifiers: InputModifiers,
    },
}
