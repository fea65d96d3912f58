use crate::{RaiseError, Value};

/// Declared parameter shape of a method or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signature {
    pub required: usize,
    pub optional: usize,
    pub rest: bool,
    pub keyrest: bool,
}

/// Arity decision made once when a thunk is bound for a fixed call shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArityCheck {
    /// the static argument count always fits
    Accepted,
    /// the static argument count never fits, raise before the body runs
    Rejected { given: usize, expected: String },
    /// count only known at call time
    Dynamic,
}

impl Signature {
    pub const NO_ARGUMENTS: Self = Self::required(0);
    pub const ONE_ARGUMENT: Self = Self::required(1);
    pub const ANY: Self = Self::rest(0);

    pub const fn required(required: usize) -> Self {
        Self {
            required,
            optional: 0,
            rest: false,
            keyrest: false,
        }
    }

    pub const fn optional(required: usize, optional: usize) -> Self {
        Self {
            required,
            optional,
            rest: false,
            keyrest: false,
        }
    }

    pub const fn rest(required: usize) -> Self {
        Self {
            required,
            optional: 0,
            rest: true,
            keyrest: false,
        }
    }

    pub const fn with_keyrest(self) -> Self {
        Self {
            keyrest: true,
            ..self
        }
    }

    #[inline]
    pub fn accepts(&self, count: usize) -> bool {
        count >= self.required && (self.rest || count <= self.required + self.optional)
    }

    pub fn is_fixed(&self) -> bool {
        self.optional == 0 && !self.rest
    }

    /// `n` for fixed signatures, `-(required + 1)` otherwise.
    pub fn arity_value(&self) -> i32 {
        if self.is_fixed() {
            self.required as i32
        } else {
            -(self.required as i32) - 1
        }
    }

    /// Expected count as shown in argument errors: `2`, `2..3` or `2+`.
    pub fn expected(&self) -> String {
        if self.rest {
            format!("{}+", self.required)
        } else if self.optional > 0 {
            format!("{}..{}", self.required, self.required + self.optional)
        } else {
            self.required.to_string()
        }
    }

    pub fn check_for_shape(&self, arg_count: i32) -> ArityCheck {
        if arg_count < 0 || self.keyrest {
            return ArityCheck::Dynamic;
        }
        let count = arg_count as usize;
        if self.accepts(count) {
            ArityCheck::Accepted
        } else {
            ArityCheck::Rejected {
                given: count,
                expected: self.expected(),
            }
        }
    }
}

impl ArityCheck {
    #[inline]
    pub fn check(&self) -> Result<(), RaiseError> {
        match self {
            ArityCheck::Rejected { given, expected } => {
                Err(RaiseError::argument_count(*given, expected.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Fast form: the caller passes a statically counted argument list.
#[inline]
pub fn check_arity_specific_args(signature: &Signature, count: usize) -> Result<(), RaiseError> {
    if signature.accepts(count) {
        Ok(())
    } else {
        Err(RaiseError::argument_count(count, signature.expected()))
    }
}

/// Generic form. A trailing keyword hash is not a positional argument when
/// the target takes keywords.
pub fn check_arity(signature: &Signature, args: &[Value], kwargs: bool) -> Result<(), RaiseError> {
    let mut count = args.len();
    if kwargs && signature.keyrest && matches!(args.last(), Some(Value::Hash(_))) {
        count -= 1;
    }
    check_arity_specific_args(signature, count)
}

/// Arity of a destructured array against block or masgn parameters.
pub fn check_array_arity(
    array: &[Value],
    required: usize,
    optional: usize,
    rest: bool,
) -> Result<(), RaiseError> {
    check_arity_specific_args(
        &Signature {
            required,
            optional,
            rest,
            keyrest: false,
        },
        array.len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RHash;
    use std::sync::Arc;

    fn fixnums(n: usize) -> Vec<Value> {
        (0..n as i64).map(Value::Fixnum).collect()
    }

    #[test]
    fn optional_parameters_bound_the_count_on_both_sides() {
        let sig = Signature::optional(2, 1);
        assert!(check_arity(&sig, &fixnums(2), false).is_ok());
        assert!(check_arity(&sig, &fixnums(3), false).is_ok());

        let too_few = check_arity(&sig, &fixnums(1), false).unwrap_err();
        assert_eq!(
            too_few.to_string(),
            "wrong number of arguments (given 1, expected 2..3)"
        );
        let too_many = check_arity(&sig, &fixnums(4), false).unwrap_err();
        assert!(too_many.is_argument_error());
    }

    #[test]
    fn rest_accepts_anything_at_or_above_required() {
        let sig = Signature::rest(2);
        assert!(!sig.accepts(1));
        for count in [2, 3, 10, 100] {
            assert!(sig.accepts(count), "rest must accept {count}");
        }
        assert_eq!(sig.expected(), "2+");
        assert_eq!(sig.arity_value(), -3);
    }

    #[test]
    fn keyword_hash_only_skipped_for_keyword_takers() {
        let mut args = fixnums(1);
        args.push(Value::Hash(Arc::new(RHash::new())));

        let plain = Signature::required(1);
        assert!(
            check_arity(&plain, &args, true).is_err(),
            "a method without keywords counts the hash"
        );
        let keywords = Signature::required(1).with_keyrest();
        assert!(check_arity(&keywords, &args, true).is_ok());
        assert!(
            check_arity(&keywords, &args, false).is_err(),
            "without the call-info flag the hash is positional"
        );
    }

    #[test]
    fn fast_and_generic_forms_agree() {
        let sig = Signature::optional(1, 2);
        for count in 0..6 {
            assert_eq!(
                check_arity_specific_args(&sig, count),
                check_arity(&sig, &fixnums(count), false),
                "forms disagree at {count}"
            );
        }
    }

    #[test]
    fn shape_checks_are_decided_once() {
        let sig = Signature::required(2);
        assert_eq!(sig.check_for_shape(2), ArityCheck::Accepted);
        assert_eq!(sig.check_for_shape(-1), ArityCheck::Dynamic);
        let rejected = sig.check_for_shape(1);
        assert_eq!(
            rejected.check().unwrap_err(),
            check_arity_specific_args(&sig, 1).unwrap_err()
        );
    }

    #[test]
    fn array_arity_for_destructuring() {
        assert!(check_array_arity(&fixnums(2), 2, 0, false).is_ok());
        assert!(check_array_arity(&fixnums(3), 2, 0, false).is_err());
        assert!(check_array_arity(&fixnums(3), 2, 0, true).is_ok());
        assert!(check_array_arity(&fixnums(1), 2, 1, true).is_err());
    }
}
