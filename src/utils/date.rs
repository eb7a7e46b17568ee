use crate::error::TrialScopeError;

const DAYS_IN_MONTH: [u8; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

fn is_leap_year(year: u32) -> bool {
    (year.is_multiple_of(4) && !year.is_multiple_of(100)) || year.is_multiple_of(400)
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn format_error(flag: &str) -> TrialScopeError {
    TrialScopeError::InvalidArgument(format!(
        "{flag} accepts YYYY, YYYY-MM, or YYYY-MM-DD format"
    ))
}

/// Expands `YYYY` / `YYYY-MM` / `YYYY-MM-DD` to a validated `YYYY-MM-DD`.
///
/// `flag` names the option in error messages.
pub(crate) fn normalize_date(value: &str, flag: &str) -> Result<String, TrialScopeError> {
    let parts = value.trim().split('-').collect::<Vec<_>>();
    let (year, month, day) = match parts.as_slice() {
        [y] => (*y, "01", "01"),
        [y, m] => (*y, *m, "01"),
        [y, m, d] => (*y, *m, *d),
        _ => return Err(format_error(flag)),
    };
    if year.len() != 4 || month.len() != 2 || day.len() != 2 {
        return Err(format_error(flag));
    }
    if !all_digits(year) || !all_digits(month) || !all_digits(day) {
        return Err(format_error(flag));
    }

    let year: u32 = year.parse().map_err(|_| format_error(flag))?;
    let month: u32 = month.parse().map_err(|_| format_error(flag))?;
    let day: u32 = day.parse().map_err(|_| format_error(flag))?;

    if !(1..=12).contains(&month) {
        return Err(TrialScopeError::InvalidArgument(format!(
            "Invalid month {month} in {flag} (must be 01-12)"
        )));
    }
    let max_day = if month == 2 && is_leap_year(year) {
        29
    } else {
        u32::from(DAYS_IN_MONTH[(month - 1) as usize])
    };
    if day < 1 || day > max_day {
        return Err(TrialScopeError::InvalidArgument(format!(
            "Invalid day {day} for month {month} in {flag}"
        )));
    }

    Ok(format!("{year:04}-{month:02}-{day:02}"))
}
