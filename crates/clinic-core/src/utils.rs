//! 通用工具函数

use crate::error::{ClinicError, Result};
use crate::models::BloodPressure;

/// 生成带前缀的顺序编号，例如 `P-0007`、`LB-0441`
pub fn format_record_code(prefix: &str, sequence: u64) -> String {
    format!("{}-{:04}", prefix, sequence)
}

/// 校验电话号码格式：可选的前导 `+`，其余为数字、空格或连字符
pub fn is_valid_phone(phone: &str) -> bool {
    let phone = phone.trim();
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    let digit_count = digits.chars().filter(|c| c.is_ascii_digit()).count();
    digit_count >= 7
        && digit_count <= 15
        && digits.chars().all(|c| c.is_ascii_digit() || c == ' ' || c == '-')
}

/// 解析 `120/80` 形式的血压读数
pub fn parse_blood_pressure(value: &str) -> Result<BloodPressure> {
    let (systolic, diastolic) = value
        .trim()
        .split_once('/')
        .ok_or_else(|| ClinicError::Validation(format!("blood pressure '{}' must look like 120/80", value)))?;

    let parse = |part: &str| {
        part.trim()
            .parse::<u16>()
            .map_err(|_| ClinicError::Validation(format!("blood pressure '{}' is not numeric", value)))
    };

    Ok(BloodPressure {
        systolic: parse(systolic)?,
        diastolic: parse(diastolic)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_record_code() {
        assert_eq!(format_record_code("P", 3), "P-0003");
        assert_eq!(format_record_code("LB", 441), "LB-0441");
        assert_eq!(format_record_code("RX", 12345), "RX-12345");
    }

    #[test]
    fn test_is_valid_phone() {
        assert!(is_valid_phone("0911223344"));
        assert!(is_valid_phone("+251 911 223 344"));
        assert!(!is_valid_phone("call me"));
        assert!(!is_valid_phone("123"));
    }

    #[test]
    fn test_parse_blood_pressure() {
        let bp = parse_blood_pressure("120/80").unwrap();
        assert_eq!(bp, BloodPressure { systolic: 120, diastolic: 80 });
        assert!(parse_blood_pressure("120").is_err());
        assert!(parse_blood_pressure("abc/80").is_err());
    }
}
