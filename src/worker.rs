//! Worker thread event loop.
//!
//! Each worker sleeps on the service condition variable and, per wake
//! cycle: grows the buffer pool at the low-water mark, sends one resolved
//! difficult reply, dispatches one queued request, and re-posts idle
//! buffers. Waits become bounded while a registration-failure retry
//! timeout is armed; waking after the timeout clears it so posting is
//! attempted again.

use std::sync::Arc;

use tracing::debug;

use crate::request::ReplyState;
use crate::service::Shared;

pub(crate) fn run(shared: Arc<Shared>, index: usize) {
    let mut reply_state = ReplyState::new(shared.config.reply_buffer_size());

    {
        let mut st = shared.state.lock();
        st.nthreads += 1;
    }
    shared.wake.notify_all();
    debug!(service = %shared.name, thread = index, "service thread started");

    loop {
        let stopping = {
            let mut st = shared.state.lock();
            while !st.wake_ready(shared.config.num_threads) {
                match st.buffer_retry {
                    Some(delay) => {
                        if shared.wake.wait_for(&mut st, delay).timed_out() {
                            st.buffer_retry = None;
                        }
                    }
                    None => shared.wake.wait(&mut st),
                }
            }
            !st.running && st.difficult_replies == 0
        };
        if stopping {
            break;
        }

        shared.check_watermark();
        shared.handle_reply(&mut reply_state);
        shared.handle_request(&mut reply_state);
        if shared.idle_pending() {
            // Failure arms the retry timeout; the next wait is bounded.
            let _ = shared.post_idle();
        }
    }

    {
        let mut st = shared.state.lock();
        st.nthreads -= 1;
        st.free_reply_states.push(reply_state);
    }
    shared.wake.notify_all();
    debug!(service = %shared.name, thread = index, "service thread exiting");
}
