use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Numeric precision the diffusion stack runs in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Half precision on accelerators, full precision on CPU.
    #[default]
    Auto,
    F16,
    F32,
}

impl Precision {
    pub fn dtype_for(self, device: &Device) -> DType {
        match self {
            Precision::Auto if device.is_cpu() => DType::F32,
            Precision::Auto | Precision::F16 => DType::F16,
            Precision::F32 => DType::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_precision_is_full_on_cpu() {
        assert_eq!(Precision::Auto.dtype_for(&Device::Cpu), DType::F32);
        assert_eq!(Precision::F16.dtype_for(&Device::Cpu), DType::F16);
    }

    #[test]
    fn precision_parses_from_lowercase() {
        let p: Precision = serde_plain::from_str("f32").unwrap();
        assert_eq!(p, Precision::F32);
    }
}
