//! Synthesized user identifiers.
//!
//! When a peer is admitted without an explicit `user_id` (local trust,
//! permissive mode, or an entry with an empty id), its identifier is the
//! handshake tuple joined with `,`. Commas and backslashes inside a part are
//! escaped with a backslash so the tuple can be recovered.

/// Join parts into a user identifier.
pub fn dump_user<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|part| {
            let part = part.as_ref();
            let mut escaped = String::with_capacity(part.len());
            for c in part.chars() {
                if c == ',' || c == '\\' {
                    escaped.push('\\');
                }
                escaped.push(c);
            }
            escaped
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a user identifier produced by [`dump_user`] back into parts.
pub fn load_user(user: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = user.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_plain_parts() {
        assert_eq!(dump_user(&["vip", "1.2.3.4", "PLAIN", "pw"]), "vip,1.2.3.4,PLAIN,pw");
    }

    #[test]
    fn escapes_separators() {
        let id = dump_user(&["a,b", "c\\d"]);
        assert_eq!(id, "a\\,b,c\\\\d");
        assert_eq!(load_user(&id), vec!["a,b".to_string(), "c\\d".to_string()]);
    }

    #[test]
    fn plain_id_loads_as_single_part() {
        assert_eq!(load_user("agent1"), vec!["agent1".to_string()]);
    }
}
