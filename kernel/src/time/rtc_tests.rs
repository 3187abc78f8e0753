//! Unit tests for RTC conversion helpers.

use super::rtc::*;

#[test_case]
fn bcd_to_binary_conversions() {
    assert_eq!(bcd_to_binary(0x00), 0);
    assert_eq!(bcd_to_binary(0x59), 59);
    assert_eq!(bcd_to_binary(0x12), 12);
    assert_eq!(bcd_to_binary(0x99), 99);
    assert_eq!(bcd_to_binary(0x47), 47);
}

#[test_case]
fn leap_year_rule() {
    assert!(is_leap_year(2020)); // divisible by 4
    assert!(is_leap_year(2000)); // divisible by 400
    assert!(!is_leap_year(1900)); // divisible by 100 but not 400
    assert!(!is_leap_year(2021));
    assert!(!is_leap_year(2022));
    assert!(!is_leap_year(2023));
    assert!(is_leap_year(2024));
}

#[test_case]
fn days_in_month_table() {
    assert_eq!(days_in_month(1, 2021), 31);
    assert_eq!(days_in_month(2, 2021), 28);
    assert_eq!(days_in_month(3, 2021), 31);
    assert_eq!(days_in_month(4, 2021), 30);
    assert_eq!(days_in_month(5, 2021), 31);
    assert_eq!(days_in_month(6, 2021), 30);
    assert_eq!(days_in_month(7, 2021), 31);
    assert_eq!(days_in_month(8, 2021), 31);
    assert_eq!(days_in_month(9, 2021), 30);
    assert_eq!(days_in_month(10, 2021), 31);
    assert_eq!(days_in_month(11, 2021), 30);
    assert_eq!(days_in_month(12, 2021), 31);

    assert_eq!(days_in_month(2, 2020), 29);
}

#[test_case]
fn datetime_unix_timestamp_round_trip() {
    let epoch = DateTime { year: 1970, month: 1, day: 1, hour: 0, minute: 0, second: 0 };
    assert_eq!(epoch.to_unix_timestamp(), 0);

    let dt = DateTime { year: 2025, month: 1, day: 21, hour: 12, minute: 0, second: 0 };
    let timestamp = dt.to_unix_timestamp();
    let converted_back = DateTime::from_unix_timestamp(timestamp);
    assert_eq!(dt, converted_back);

    let y2k = DateTime { year: 2000, month: 1, day: 1, hour: 0, minute: 0, second: 0 };
    assert_eq!(y2k.to_unix_timestamp(), 946684800);
}
