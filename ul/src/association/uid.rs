use std::borrow::Cow;

/// Discard trailing padding characters admitted in UID fields.
pub(crate) fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with('\0') || uid.ends_with(' ') {
        Cow::Owned(
            uid.trim_end_matches(|c: char| c == '\0' || c == ' ')
                .to_string(),
        )
    } else {
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::trim_uid;

    #[test]
    fn trim_uid_removes_padding_only() {
        assert_eq!(trim_uid("1.2.840.10008.1.1\0".into()), "1.2.840.10008.1.1");
        assert_eq!(trim_uid("1.2.840.10008.1.1".into()), "1.2.840.10008.1.1");
        assert_eq!(trim_uid("1.2.840.10008.1.2.1 ".into()), "1.2.840.10008.1.2.1");
    }
}
