// 🔢 CNPJ helpers - pure functions, no I/O
//
// CNPJ = 12 base digits + 2 check digits, each computed modulo 11 over fixed
// per-position weights.

const WEIGHTS_FIRST: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
const WEIGHTS_SECOND: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

/// Why a CNPJ was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CnpjDefect {
    /// Not 14 digits after stripping formatting
    WrongLength(usize),
    /// All digits equal (00000000000000, 11111111111111, ...)
    RepeatedDigits,
    /// Check digits do not match
    CheckDigits,
}

/// Keep digits only: "11.444.777/0001-61" → "11444777000161"
pub fn clean(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Format 14 digits as XX.XXX.XXX/XXXX-XX, None for anything else
pub fn format(cnpj: &str) -> Option<String> {
    let digits = clean(cnpj);
    if digits.len() != 14 {
        return None;
    }
    Some(format!(
        "{}.{}.{}/{}-{}",
        &digits[..2],
        &digits[2..5],
        &digits[5..8],
        &digits[8..12],
        &digits[12..]
    ))
}

fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    let rest = sum % 11;
    if rest < 2 {
        0
    } else {
        11 - rest
    }
}

/// Validate an already-cleaned or raw CNPJ
pub fn check(raw: &str) -> Result<(), CnpjDefect> {
    let cleaned = clean(raw);
    let digits: Vec<u32> = cleaned.chars().filter_map(|c| c.to_digit(10)).collect();

    if digits.len() != 14 {
        return Err(CnpjDefect::WrongLength(digits.len()));
    }

    if digits.iter().all(|d| *d == digits[0]) {
        return Err(CnpjDefect::RepeatedDigits);
    }

    let first = check_digit(&digits[..12], &WEIGHTS_FIRST);
    if digits[12] != first {
        return Err(CnpjDefect::CheckDigits);
    }

    let second = check_digit(&digits[..13], &WEIGHTS_SECOND);
    if digits[13] != second {
        return Err(CnpjDefect::CheckDigits);
    }

    Ok(())
}

pub fn is_valid(raw: &str) -> bool {
    check(raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_formatted() {
        assert_eq!(clean("12.345.678/0001-90"), "12345678000190");
        assert_eq!(clean("  11444777000161 "), "11444777000161");
        assert_eq!(clean(""), "");
    }

    #[test]
    fn test_valid_check_digits() {
        assert!(is_valid("11444777000161"));
        assert!(is_valid("11.444.777/0001-61"));
        assert!(is_valid("11222333000181"));
    }

    #[test]
    fn test_invalid_check_digit() {
        assert_eq!(check("11444777000160"), Err(CnpjDefect::CheckDigits));
        assert_eq!(check("11444777000171"), Err(CnpjDefect::CheckDigits));
    }

    #[test]
    fn test_wrong_length() {
        assert_eq!(check("123"), Err(CnpjDefect::WrongLength(3)));
        assert_eq!(check("114447770001611"), Err(CnpjDefect::WrongLength(15)));
        assert_eq!(check("abc"), Err(CnpjDefect::WrongLength(0)));
    }

    #[test]
    fn test_repeated_digits_rejected() {
        assert_eq!(check("00000000000000"), Err(CnpjDefect::RepeatedDigits));
        assert_eq!(check("11111111111111"), Err(CnpjDefect::RepeatedDigits));
    }

    #[test]
    fn test_format() {
        assert_eq!(format("12345678000190").as_deref(), Some("12.345.678/0001-90"));
        assert_eq!(format("123"), None);
    }
}
