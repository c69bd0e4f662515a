use core::{any::Any, ops::Range};

pub(crate) trait RangeSplitAtHalf {
    fn split_at_half(&self) -> (Range<usize>, Range<usize>);
}

impl RangeSplitAtHalf for Range<usize> {
    #[inline]
    fn split_at_half(&self) -> (Range<usize>, Range<usize>) {
        let len = self
            .end
            .checked_sub(self.start)
            .expect("RangeSplitAtHalf::split_at");
        let mid = len / 2;
        let mid_abs = self.start + mid;
        (self.start..mid_abs, mid_abs..self.end)
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_at_half_covers_range() {
        assert_eq!((3..8).split_at_half(), (3..5, 5..8));
        assert_eq!((0..1).split_at_half(), (0..0, 0..1));
        assert_eq!((4..4).split_at_half(), (4..4, 4..4));
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 7)).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 7");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(5_u8)).unwrap_err();
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }
}
