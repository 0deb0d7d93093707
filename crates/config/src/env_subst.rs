/// Replace `${ENV_VAR}` placeholders in raw config text.
///
/// Unresolvable or malformed placeholders are emitted verbatim so a typo
/// fails loudly at parse time instead of silently becoming an empty string.
pub fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    },
                }
                rest = &after[end + 1..];
            },
            _ => {
                // No closing brace (or empty name) — literal from here on.
                out.push_str("${");
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    #![allow(unsafe_code)] // set_var/remove_var are unsafe in edition 2024

    use super::*;

    #[test]
    fn substitutes_known_var() {
        unsafe { std::env::set_var("FLEETGATE_TEST_VAR", "hunter2") };
        assert_eq!(
            substitute_env("secret = \"${FLEETGATE_TEST_VAR}\""),
            "secret = \"hunter2\""
        );
        unsafe { std::env::remove_var("FLEETGATE_TEST_VAR") };
    }

    #[test]
    fn leaves_unknown_var_verbatim() {
        assert_eq!(
            substitute_env("${FLEETGATE_NO_SUCH_VAR_XYZ}"),
            "${FLEETGATE_NO_SUCH_VAR_XYZ}"
        );
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_env("x = ${OOPS"), "x = ${OOPS");
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(substitute_env("bind = \"0.0.0.0\""), "bind = \"0.0.0.0\"");
    }
}
