// Drives every future to completion. The first one to finish cancels the token, so the
// others are expected to watch it and wind down.
#[macro_export]
macro_rules! run_all {
    ( $cancellation_token:expr, $( $fut:expr ),+ $(,)?) => {
        tokio::join!(
            $(
                async {
                    let result = $fut.await;
                    $cancellation_token.cancel();
                    result
                }
            ),*
        )
    };
}
