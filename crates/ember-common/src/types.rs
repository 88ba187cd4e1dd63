//! Element data types and device classes shared by every crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element type of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F16,
    I32,
    I64,
    U8,
    I8,
}

impl DataType {
    pub const ALL: [DataType; 6] =
        [DataType::F32, DataType::F16, DataType::I32, DataType::I64, DataType::U8, DataType::I8];

    /// Size of one element in bytes.
    pub const fn element_size(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 => 2,
            DataType::I64 => 8,
            DataType::U8 | DataType::I8 => 1,
        }
    }

    /// OpenCL C spelling of the scalar type, used for `-DDATA_TYPE=` specialisation.
    pub const fn cl_type(self) -> &'static str {
        match self {
            DataType::F32 => "float",
            DataType::F16 => "half",
            DataType::I32 => "int",
            DataType::I64 => "long",
            DataType::U8 => "uchar",
            DataType::I8 => "char",
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F16)
    }

    /// Build options specialising a kernel source for this element type.
    ///
    /// Half precision additionally enables the `cl_khr_fp16` pragma guard
    /// inside the kernel sources.
    pub fn cl_build_options(self) -> Vec<String> {
        let mut options = vec![format!("-DDATA_TYPE={}", self.cl_type())];
        if self == DataType::F16 {
            options.push("-DENABLE_FP16".to_string());
        }
        options
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::I32 => write!(f, "i32"),
            Self::I64 => write!(f, "i64"),
            Self::U8 => write!(f, "u8"),
            Self::I8 => write!(f, "i8"),
        }
    }
}

impl FromStr for DataType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "f32" | "float" | "float32" => Ok(Self::F32),
            "f16" | "half" | "float16" => Ok(Self::F16),
            "i32" | "int" | "int32" => Ok(Self::I32),
            "i64" | "long" | "int64" => Ok(Self::I64),
            "u8" | "uchar" | "uint8" => Ok(Self::U8),
            "i8" | "char" | "int8" => Ok(Self::I8),
            other => Err(format!("unknown data type: {other}")),
        }
    }
}

/// Class of device a tensor's memory lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    OpenCl,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::OpenCl => write!(f, "opencl"),
        }
    }
}

impl FromStr for DeviceType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "opencl" | "cl" | "gpu" => Ok(Self::OpenCl),
            other => Err(format!("unknown device type: {other}")),
        }
    }
}

/// Integer division rounding towards positive infinity.
#[inline]
pub const fn ceil_div(value: usize, divisor: usize) -> usize {
    value.div_ceil(divisor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_sizes() {
        assert_eq!(DataType::F32.element_size(), 4);
        assert_eq!(DataType::F16.element_size(), 2);
        assert_eq!(DataType::I64.element_size(), 8);
        assert_eq!(DataType::U8.element_size(), 1);
    }

    #[test]
    fn cl_type_names() {
        assert_eq!(DataType::F32.cl_type(), "float");
        assert_eq!(DataType::F16.cl_type(), "half");
        assert_eq!(DataType::I8.cl_type(), "char");
    }

    #[test]
    fn half_build_options_enable_fp16() {
        assert_eq!(DataType::F32.cl_build_options(), vec!["-DDATA_TYPE=float".to_string()]);
        let opts = DataType::F16.cl_build_options();
        assert!(opts.contains(&"-DDATA_TYPE=half".to_string()));
        assert!(opts.contains(&"-DENABLE_FP16".to_string()));
    }

    #[test]
    fn parse_round_trips_display() {
        for dt in DataType::ALL {
            assert_eq!(dt.to_string().parse::<DataType>().unwrap(), dt);
        }
        assert!("bf16".parse::<DataType>().is_err());
    }

    #[test]
    fn device_type_aliases() {
        assert_eq!("GPU".parse::<DeviceType>().unwrap(), DeviceType::OpenCl);
        assert_eq!("cpu".parse::<DeviceType>().unwrap(), DeviceType::Cpu);
    }

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(16, 4), 4);
        assert_eq!(ceil_div(17, 4), 5);
        assert_eq!(ceil_div(0, 4), 0);
    }
}
