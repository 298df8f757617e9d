//! Error types.
//!
//! Almost everything goes through the [`Res`] alias. Invariant violations
//! inside the solver are reported as a single [`ErrorKind::Internal`] kind
//! carrying a human-readable message, so that a bug in the search loop is
//! distinguishable from a user-level problem.
//!
//! A backend answering `unknown` is *not* an error: the solver treats it as
//! sat (conservative) and emits a `msg` event tagged `backend-unknown`.
//!
//! [`Res`]: type.Res.html (Res type)
//! [`ErrorKind::Internal`]: enum.ErrorKind.html#variant.Internal
//! (Internal variant of the ErrorKind enum)

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Res;
    }

    errors {
        #[doc = "Internal invariant violation, indicates a bug."]
        Internal(msg: String) {
            description("internal error")
            display("[bug] {}", msg)
        }
        #[doc = "Solve was cancelled (best-effort)."]
        Cancelled {
            description("cancelled")
            display("cancelled")
        }
    }
}

impl Error {
    /// True if the kind of the error is [`ErrorKind::Internal`][internal].
    ///
    /// [internal]: enum.ErrorKind.html#variant.Internal
    /// (ErrorKind's Internal variant)
    pub fn is_internal(&self) -> bool {
        match *self.kind() {
            ErrorKind::Internal(_) => true,
            _ => false,
        }
    }

    /// True if the kind of the error is [`ErrorKind::Cancelled`][cancelled].
    ///
    /// [cancelled]: enum.ErrorKind.html#variant.Cancelled
    /// (ErrorKind's Cancelled variant)
    pub fn is_cancelled(&self) -> bool {
        match *self.kind() {
            ErrorKind::Cancelled => true,
            _ => false,
        }
    }
}

/// Convenience constructor for internal errors.
pub fn internal<S: Into<String>>(msg: S) -> Error {
    ErrorKind::Internal(msg.into()).into()
}

/// Prints an error.
pub fn print_err(errs: &Error) {
    println!("({} \"", crate::common::conf.bad("error"));
    for err in errs.iter() {
        for line in format!("{}", err).lines() {
            println!("  {}", line)
        }
    }
    println!("\")")
}
