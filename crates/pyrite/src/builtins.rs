use strum::{EnumString, FromRepr, IntoStaticStr};

/// Builtin functions callable without a definition in the script.
///
/// A module-level assignment to one of these names shadows the builtin
/// everywhere, so call sites only compile to `CallBuiltin` for unshadowed
/// names. `input` is not listed here: it compiles to its own opcode because
/// it suspends the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub(crate) enum Builtin {
    Print,
    Len,
    Range,
    Int,
    Str,
    Bool,
}

impl Builtin {
    /// Name as it appears in scripts, for error messages.
    pub(crate) fn name(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn builtin_names_round_trip() {
        assert_eq!(Builtin::from_str("print"), Ok(Builtin::Print));
        assert_eq!(Builtin::from_str("len"), Ok(Builtin::Len));
        assert_eq!(Builtin::Range.name(), "range");
        assert!(Builtin::from_str("exec").is_err());
    }

    #[test]
    fn builtin_ids_round_trip() {
        assert_eq!(Builtin::from_repr(Builtin::Bool as u8), Some(Builtin::Bool));
        assert_eq!(Builtin::from_repr(200), None);
    }
}
