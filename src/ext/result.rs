//! Extensions to `Result`.

/// Flip `Result<T, E>` to `Result<E, T>`.
pub trait FlipResult<T, E> {
    /// Flip `Result<T, E>` to `Result<E, T>`.
    fn flip(self) -> Result<E, T>;
}

impl<T, E> FlipResult<T, E> for Result<T, E> {
    fn flip(self) -> Result<E, T> {
        match self {
            Ok(t) => Err(t),
            Err(e) => Ok(e),
        }
    }
}

/// Wrap a bare value in `Ok`, for use at the end of a method chain
/// that would otherwise need an explicit `Ok(...)` wrapper statement.
pub trait WrapOk<T> {
    /// Wrap `self` in `Ok`.
    fn wrap_ok<E>(self) -> Result<T, E>;
}

impl<T> WrapOk<T> for T {
    fn wrap_ok<E>(self) -> Result<T, E> {
        Ok(self)
    }
}

/// Wrap a bare value in `Err`, for use at the end of a method chain
/// that would otherwise need an explicit `Err(...)` wrapper statement.
pub trait WrapErr<E> {
    /// Wrap `self` in `Err`.
    fn wrap_err<T>(self) -> Result<T, E>;
}

impl<E> WrapErr<E> for E {
    fn wrap_err<T>(self) -> Result<T, E> {
        Err(self)
    }
}
