//! Numbered-name generation for attachments, chats and temp files.

/// Return `name` if it is free, otherwise the first free `"<stem> N.<ext>"`
/// (or `"<name> N"` when there is no extension), counting N from 1.
pub fn generate_numbered_name<S: AsRef<str>>(name: &str, taken: &[S]) -> String {
    let is_taken = |candidate: &str| taken.iter().any(|t| t.as_ref() == candidate);
    if !is_taken(name) {
        return name.to_string();
    }

    let split = name.rfind('.').map(|dot| (&name[..dot], &name[dot + 1..]));
    (1..)
        .map(|n| match split {
            Some((stem, ext)) => format!("{stem} {n}.{ext}"),
            None => format!("{name} {n}"),
        })
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| name.to_string())
}
