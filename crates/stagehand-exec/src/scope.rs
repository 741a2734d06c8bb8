//! Scoped acquire/release around a block of bearer operations

use tracing::{debug, error, warn};

use crate::error::ExecError;
use crate::traits::ExecutorBearer;

/// Abandons the bearer if the scope is dropped before release has finished
struct ScopeGuard<'a, B: ExecutorBearer + ?Sized> {
    bearer: &'a mut B,
    armed: bool,
}

impl<B: ExecutorBearer + ?Sized> Drop for ScopeGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                bearer = self.bearer.bearer_type(),
                "scope dropped before release, abandoning bearer"
            );
            self.bearer.abandon();
        }
    }
}

/// Acquire `bearer`, run `body` against it, then release it.
///
/// Release runs on every exit path, including a failed acquire (to clean up
/// anything acquire managed to create) and a failed body. When both the body
/// and the release fail, the body's error is returned and the release error
/// is logged. If the returned future is dropped before it completes, the
/// bearer is abandoned instead (see [`ExecutorBearer::abandon`]).
///
/// # Errors
/// Returns the acquire error, the body's error, or the release error, in
/// that order of precedence.
pub async fn with_bearer<B, T, E, F>(bearer: &mut B, body: F) -> Result<T, E>
where
    B: ExecutorBearer + ?Sized,
    E: From<ExecError>,
    F: AsyncFnOnce(&B) -> Result<T, E>,
{
    debug!(bearer = bearer.bearer_type(), "acquiring bearer");

    let mut guard = ScopeGuard {
        bearer,
        armed: true,
    };

    if let Err(acquire_err) = guard.bearer.acquire().await {
        let released = guard.bearer.release().await;
        guard.armed = false;
        if let Err(release_err) = released {
            error!(error = %release_err, "release after failed acquire also failed");
        }
        return Err(acquire_err.into());
    }

    let result = body(&*guard.bearer).await;
    let released = guard.bearer.release().await;
    guard.armed = false;

    debug!(bearer = guard.bearer.bearer_type(), "bearer released");

    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err.into()),
        (Err(body_err), Ok(())) => Err(body_err),
        (Err(body_err), Err(release_err)) => {
            error!(error = %release_err, "release failed after scope error");
            Err(body_err)
        }
    }
}
