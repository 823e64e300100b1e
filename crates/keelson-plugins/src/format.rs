//! Binary format detection for plugin modules

use crate::{PluginError, PluginResult};

const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
const CORE_MODULE_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
const COMPONENT_VERSION: [u8; 4] = [0x0d, 0x00, 0x01, 0x00];

/// Module dialect identified from the header bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    /// Core module targeting WASI preview 1
    CoreModule,
    /// Component-model binary
    Component,
    /// Not a WASM binary, or an unknown version
    Unknown,
}

impl BinaryFormat {
    pub fn is_supported(self) -> bool {
        self == Self::CoreModule
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::CoreModule => "core module (wasi preview 1)",
            Self::Component => "component model",
            Self::Unknown => "unknown",
        }
    }
}

pub fn detect_format(bytes: &[u8]) -> BinaryFormat {
    if bytes.len() < 8 || bytes[..4] != WASM_MAGIC {
        return BinaryFormat::Unknown;
    }
    match [bytes[4], bytes[5], bytes[6], bytes[7]] {
        CORE_MODULE_VERSION => BinaryFormat::CoreModule,
        COMPONENT_VERSION => BinaryFormat::Component,
        _ => BinaryFormat::Unknown,
    }
}

/// Accept only the supported dialect
pub fn ensure_supported(bytes: &[u8]) -> PluginResult<BinaryFormat> {
    match detect_format(bytes) {
        BinaryFormat::CoreModule => Ok(BinaryFormat::CoreModule),
        BinaryFormat::Component => Err(PluginError::UnsupportedFormat(
            "component-model binaries are not supported, build for wasm32-wasip1".to_string(),
        )),
        BinaryFormat::Unknown => Err(PluginError::UnsupportedFormat(
            "missing wasm header or unknown version".to_string(),
        )),
    }
}
