//! Principal normalization and artifact file naming.

/// Qualify a principal with `@realm` unless it already names one.
pub fn normalize_principal(name: &str, realm: &str) -> String {
    if name.contains('@') {
        name.to_string()
    } else {
        format!("{name}@{realm}")
    }
}

/// Principal of a build worker host.
///
/// `koji-worker-3` becomes `worker/koji-worker-3@REALM`; names that already
/// carry the `worker/` service prefix are only realm-qualified.
pub fn worker_principal(concrete_name: &str, realm: &str) -> String {
    if concrete_name.starts_with("worker/") {
        normalize_principal(concrete_name, realm)
    } else {
        normalize_principal(&format!("worker/{concrete_name}"), realm)
    }
}

/// Encode a name into a single safe path component.
///
/// Letters, digits and `_.-~` pass through, a space becomes `+`, and every
/// other byte is written as `%XX`. `host/web@KOJI.BOX` therefore maps to
/// `host%2Fweb%40KOJI.BOX`.
pub fn encode_file_stem(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
