/// Map a caller-supplied name onto `[A-Za-z0-9._-]`, replacing anything else
/// with `_`. Empty input stays empty; callers reject it themselves.
pub fn sanitize(raw: &str) -> String {
	raw.chars()
		.map(|c| if is_safe(c) { c } else { '_' })
		.collect()
}

fn is_safe(c: char) -> bool {
	c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}
