use sqlx::FromRow;

/// Physical storage unit, one row per distinct content key
#[derive(Debug, Clone, FromRow)]
pub struct ContentBlob {
    pub content_key: String,
    pub byte_size: i64,
    pub ref_count: i64,
    pub storage_path: String,
    pub created_at: String,
}

/// Provider-relative path of a blob: `ab/cd/abcd...`
pub fn blob_storage_path(content_key: &str) -> String {
    format!("{}/{}/{}", &content_key[0..2], &content_key[2..4], content_key)
}

/// Whether `s` looks like a content key (lowercase hex SHA-256)
pub fn is_content_key(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_storage_path() {
        let key = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert_eq!(
            blob_storage_path(key),
            "2c/f2/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_is_content_key() {
        assert!(is_content_key(
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        ));
        assert!(!is_content_key("2CF24DBA"));
        assert!(!is_content_key("../../etc/passwd"));
        assert!(!is_content_key(
            "2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824"
        ));
    }
}
