/// Replace the dynamic segments of a concrete path with `{id}` templates.
///
/// Segments already written as `{name}`, `:name`, or `@name` are left
/// untouched; everything else that looks like a UUID or a bare integer
/// becomes `{id}`. Idempotent: `parameterize(parameterize(p)) == parameterize(p)`.
pub fn parameterize(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return path.to_string();
    }

    path.split('/')
        .map(parameterize_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn parameterize_segment(segment: &str) -> &str {
    if segment.is_empty() || is_already_parameterized(segment) {
        return segment;
    }
    if is_uuid(segment) {
        return "{id}";
    }
    if is_numeric(segment) {
        return "{id}";
    }
    segment
}

fn is_already_parameterized(segment: &str) -> bool {
    (segment.starts_with('{') && segment.ends_with('}'))
        || segment.starts_with(':')
        || segment.starts_with('@')
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Canonical 8-4-4-4-12 hex UUID grammar, case-insensitive.
fn is_uuid(segment: &str) -> bool {
    let groups: Vec<&str> = segment.split('-').collect();
    let lens = [8, 4, 4, 4, 12];
    if groups.len() != lens.len() {
        return false;
    }
    groups
        .iter()
        .zip(lens)
        .all(|(g, len)| g.len() == len && g.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_unchanged() {
        assert_eq!(parameterize("/"), "/");
    }

    #[test]
    fn numeric_segments_become_id() {
        assert_eq!(parameterize("/v1/users/123/orders/456"), "/v1/users/{id}/orders/{id}");
    }

    #[test]
    fn uuid_segment_parameterized_case_insensitively() {
        let lower = "/v1/users/550e8400-e29b-41d4-a716-446655440000";
        let upper = "/v1/users/550E8400-E29B-41D4-A716-446655440000";
        assert_eq!(parameterize(lower), "/v1/users/{id}");
        assert_eq!(parameterize(upper), "/v1/users/{id}");
    }

    #[test]
    fn already_parameterized_segments_preserved() {
        assert_eq!(parameterize("/v1/users/{id}"), "/v1/users/{id}");
        assert_eq!(parameterize("/v1/users/:id"), "/v1/users/:id");
        assert_eq!(parameterize("/v1/users/@id"), "/v1/users/@id");
    }

    #[test]
    fn literal_segments_untouched() {
        assert_eq!(parameterize("/v2/orders/abc"), "/v2/orders/abc");
    }

    #[test]
    fn idempotent() {
        let cases = ["/v1/users/123", "/v1/users/{id}/orders/456", "/", "/a/b/c"];
        for p in cases {
            let once = parameterize(p);
            let twice = parameterize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn leading_and_trailing_slashes_preserved() {
        assert_eq!(parameterize("/v1/users/123/"), "/v1/users/{id}/");
    }
}
