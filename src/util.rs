//! Misc. helper functions

/// Strips path separators (and NUL) from a flow identifier so it is safe to
/// use as a file basename.
pub fn sanitize_ident(ident: &str) -> String {
    ident
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_ident() {
        assert_eq!(
            sanitize_ident("10.0.0.1:49152->10.0.0.2:80"),
            "10.0.0.1:49152->10.0.0.2:80"
        );
        assert_eq!(sanitize_ident("../../etc/passwd"), "....etcpasswd");
        assert_eq!(sanitize_ident("a\\b\0c"), "abc");
    }
}
