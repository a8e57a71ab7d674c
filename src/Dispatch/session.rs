use std::future::Future;

use crate::Messages::SessionToken;

tokio::task_local! {
    static CURRENT_SESSION: Option<SessionToken>;
}

/// Session of the service call running on this task, if any.
///
/// Follows the task across `.await` points and worker-thread hops; returns
/// `None` outside [`with_session`].
pub fn current_session() -> Option<SessionToken> {
    CURRENT_SESSION.try_with(|s| s.clone()).ok().flatten()
}

/// Run `fut` with `session` installed as the current session.
pub async fn with_session<F: Future>(session: Option<SessionToken>, fut: F) -> F::Output {
    CURRENT_SESSION.scope(session, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_survives_suspension() {
        assert_eq!(current_session(), None);

        let token = SessionToken("s-42".to_string());
        let seen = with_session(Some(token.clone()), async {
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            current_session()
        })
        .await;

        assert_eq!(seen, Some(token));
        assert_eq!(current_session(), None);
    }

    #[tokio::test]
    async fn nested_scope_shadows_outer() {
        let outer = SessionToken("outer".to_string());
        let inner = SessionToken("inner".to_string());
        let (a, b) = with_session(Some(outer.clone()), async {
            let a = with_session(Some(inner.clone()), async { current_session() }).await;
            (a, current_session())
        })
        .await;
        assert_eq!(a, Some(inner));
        assert_eq!(b, Some(outer));
    }
}
