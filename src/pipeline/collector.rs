use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};

enum Event<T> {
    Item(T),
    Tick,
    End,
}

/// Groups `input` into batches emitted every `window`.
///
/// Empty windows are skipped and whatever is buffered when the input ends is flushed, so a
/// slow item delays at most one window instead of the whole batch.
pub fn buffer_time<S>(input: S, window: Duration) -> impl Stream<Item = Vec<S::Item>>
where
    S: Stream,
{
    stream! {
        let mut timer = tokio::time::interval_at(Instant::now() + window, window);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(input);

        let mut buffer = Vec::new();
        loop {
            let event = tokio::select! {
                item = input.next() => item.map_or(Event::End, Event::Item),
                _ = timer.tick() => Event::Tick,
            };
            match event {
                Event::Item(item) => buffer.push(item),
                Event::Tick => {
                    if !buffer.is_empty() {
                        yield std::mem::take(&mut buffer);
                    }
                }
                Event::End => break,
            }
        }
        if !buffer.is_empty() {
            yield buffer;
        }
    }
}
