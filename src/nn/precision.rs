use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::loom::num::DataType;

/// How a layer runs its matrix products.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PrecisionMode {
    /// Full-precision kernels on the layer's own tensors.
    #[default]
    Full,
    /// One fused kernel per product: half-precision operands, full-precision accumulation.
    FastFp16,
    /// Operands are converted into half-precision shadow tensors, multiplied there and converted back.
    ConvertFp16,
}

impl PrecisionMode {
    /// Resolves the requested flags for tensors of element type `r#type`.
    ///
    /// `fast_fp16` takes precedence over `convert_fp16`, and both are dropped unless the
    /// element type is `f32`. Overridden flags are logged, not rejected.
    pub fn resolve(r#type: DataType, fast_fp16: bool, convert_fp16: bool) -> Self {
        if !r#type.is_full_precision() {
            if fast_fp16 || convert_fp16 {
                log::warn!("mixed precision is only available for f32, running {type} kernels");
            }
            return Self::Full;
        }
        match (fast_fp16, convert_fp16) {
            (true, true) => {
                log::warn!("both fast and converted fp16 requested, using fast fp16");
                Self::FastFp16
            }
            (true, false) => Self::FastFp16,
            (false, true) => Self::ConvertFp16,
            (false, false) => Self::Full,
        }
    }

    /// Returns `true` if half-precision shadow tensors are needed.
    #[inline]
    pub fn needs_shadow(self) -> bool {
        matches!(self, Self::ConvertFp16)
    }
}

#[cfg(test)]
mod tests {
    use super::PrecisionMode;
    use crate::loom::num::DataType;

    #[test]
    fn test_resolve() {
        use PrecisionMode::*;

        let cases = [
            (DataType::F32, false, false, Full),
            (DataType::F32, true, false, FastFp16),
            (DataType::F32, false, true, ConvertFp16),
            (DataType::F32, true, true, FastFp16),
            (DataType::F64, true, false, Full),
            (DataType::F64, false, true, Full),
            (DataType::F16, true, true, Full),
        ];
        for (r#type, fast, convert, mode) in cases {
            assert_eq!(PrecisionMode::resolve(r#type, fast, convert), mode);
        }
        assert!(ConvertFp16.needs_shadow());
        assert!(!FastFp16.needs_shadow());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&PrecisionMode::FastFp16)?;
        assert_eq!(json, "\"FastFp16\"");
        let mode: PrecisionMode = serde_json::from_str(&json)?;
        assert_eq!(mode, PrecisionMode::FastFp16);
        Ok(())
    }
}
