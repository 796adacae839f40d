use std::fmt;

/// Element types a fusekit tensor can hold.
///
/// Kernels compute in F16/BF16/F32; the integer types carry sequence
/// offsets and masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 16-bit brain float
    BF16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 64-bit IEEE 754 double-precision float
    F64,
    /// 8-bit unsigned integer (dropout masks)
    U8,
    /// 32-bit signed integer (cumulative sequence lengths)
    I32,
    /// 64-bit signed integer
    I64,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this is a 16-bit float that kernels may up-cast to F32.
    pub fn is_reduced_precision(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Stable integer code used when describing tensors across the C ABI.
    pub fn abi_code(&self) -> i32 {
        match self {
            DType::F16 => 0,
            DType::BF16 => 1,
            DType::F32 => 2,
            DType::F64 => 3,
            DType::U8 => 4,
            DType::I32 => 5,
            DType::I64 => 6,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::I64.size_in_bytes(), 8);
        assert_eq!(DType::U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_precision_classes() {
        assert!(DType::F16.is_reduced_precision());
        assert!(DType::BF16.is_reduced_precision());
        assert!(!DType::F32.is_reduced_precision());
        assert!(DType::F32.is_float());
        assert!(!DType::I32.is_float());
    }

    #[test]
    fn test_abi_codes_unique() {
        let all = [
            DType::F16, DType::BF16, DType::F32, DType::F64,
            DType::U8, DType::I32, DType::I64,
        ];
        let mut codes: Vec<i32> = all.iter().map(|d| d.abi_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_display() {
        assert_eq!(DType::BF16.to_string(), "bf16");
        assert_eq!(DType::I32.to_string(), "i32");
    }
}
