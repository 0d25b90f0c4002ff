//! Extensions to `error_stack`.

use colored::Colorize;
use error_stack::ResultExt;

/// Used to provide help text to an error.
///
/// This is meant to be readable by users of the application;
/// ideally help text is relatively terse and only displayed when
/// you're pretty sure what the user can do to fix the problem.
pub trait ErrorHelper {
    /// Provide help text to the user with what they can do to fix the problem.
    fn help<S: AsRef<str>>(self, help_text: S) -> Self;

    /// Optionally provide help text to the user with what they can do to fix the problem.
    fn help_if<S: AsRef<str>>(self, should_help: bool, help_text: S) -> Self;

    /// Lazily provide help text to the user with what they can do to fix the problem.
    fn help_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, helper: F) -> Self;
}

impl<T, C> ErrorHelper for error_stack::Result<T, C> {
    fn help<S: AsRef<str>>(self, help_text: S) -> Self {
        let help = help_literal();
        let help_text = help_text.as_ref();
        self.attach_printable_lazy(|| format!("{help} {help_text}"))
    }

    fn help_if<S: AsRef<str>>(self, should_help: bool, help_text: S) -> Self {
        if should_help {
            let help = help_literal();
            let help_text = help_text.as_ref();
            self.attach_printable_lazy(|| format!("{help} {help_text}"))
        } else {
            self
        }
    }

    fn help_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, helper: F) -> Self {
        let help = help_literal();
        let help_text = helper();
        let help_text = help_text.as_ref();
        self.attach_printable_lazy(|| format!("{help} {help_text}"))
    }
}

fn help_literal() -> String {
    "help:".bold().blue().to_string()
}

/// Used to provide a description of the operation being performed when an error occurred.
pub trait DescribeContext {
    /// Provide a human-readable description of the context in which the error occurred.
    fn describe<S: AsRef<str>>(self, description: S) -> Self;

    /// Optionally provide a human-readable description of the context in which the error occurred.
    fn describe_if<S: AsRef<str>>(self, should_describe: bool, description: S) -> Self;

    /// Lazily provide a human-readable description of the context in which the error occurred.
    fn describe_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, describer: F) -> Self;
}

impl<T, C> DescribeContext for error_stack::Result<T, C> {
    fn describe<S: AsRef<str>>(self, description: S) -> Self {
        let context = describe_literal();
        let description = description.as_ref();
        self.attach_printable_lazy(|| format!("{context} {description}"))
    }

    fn describe_if<S: AsRef<str>>(self, should_describe: bool, description: S) -> Self {
        if should_describe {
            let context = describe_literal();
            let description = description.as_ref();
            self.attach_printable_lazy(|| format!("{context} {description}"))
        } else {
            self
        }
    }

    fn describe_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, describer: F) -> Self {
        let context = describe_literal();
        let description = describer();
        let description = description.as_ref();
        self.attach_printable_lazy(|| format!("{context} {description}"))
    }
}

fn describe_literal() -> String {
    "context:".bold().green().to_string()
}

/// Convenience alternative to `change_context` for call sites that otherwise
/// have to name the target context type explicitly.
pub trait IntoContext<T> {
    /// Change the context of this result to `C`.
    fn into_context<C: error_stack::Context>(self, context: C) -> error_stack::Result<T, C>;
}

impl<T, E> IntoContext<T> for error_stack::Result<T, E> {
    fn into_context<C: error_stack::Context>(self, context: C) -> error_stack::Result<T, C> {
        self.change_context(context)
    }
}

/// Attach a link to relevant documentation to an error.
pub trait ErrorDocReference {
    /// Lazily attach a link to documentation relevant to the error.
    fn documentation_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, reference: F) -> Self;
}

impl<T, C> ErrorDocReference for error_stack::Result<T, C> {
    fn documentation_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, reference: F) -> Self {
        let label = "docs:".bold().cyan().to_string();
        let reference = reference();
        let reference = reference.as_ref();
        self.attach_printable_lazy(|| format!("{label} {reference}"))
    }
}

/// Attach a pointer to operator support channels to a fatal, top-level error.
///
/// Meant to be used exactly once, on the final error returned from `main`,
/// not on every error as it propagates up the stack.
pub trait FatalErrorReport {
    /// Attach a note directing the user to file an issue or contact support
    /// if the problem persists.
    fn request_support(self) -> Self;
}

impl<T, C> FatalErrorReport for error_stack::Result<T, C> {
    fn request_support(self) -> Self {
        let label = "support:".bold().magenta().to_string();
        self.attach_printable_lazy(move || {
            format!(
                "{label} if this error persists, please open an issue with the output above: {}",
                crate::doc::link::operator_support()
            )
        })
    }
}
