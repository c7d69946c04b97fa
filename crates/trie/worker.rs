/// Splits `total` items into at most `tasks` contiguous index ranges of
/// near-equal size. Trailing ranges may be empty when `total < tasks`,
/// those are dropped.
pub fn generate_ranges(total: usize, tasks: usize) -> Vec<(usize, usize)> {
    if total == 0 || tasks == 0 {
        return vec![];
    }
    let step = total.div_ceil(tasks);
    (0..tasks)
        .map(|i| (i * step, ((i + 1) * step).min(total)))
        .filter(|(start, end)| start < end)
        .collect()
}

/// Runs `job(index, start, end)` over the index ranges produced by
/// [`generate_ranges`], one scoped thread per non-empty range, and joins
/// them all before returning. `index` is the range's original position,
/// preserved even when earlier ranges come out empty.
pub fn parallel_worker<F>(total: usize, concurrency: usize, job: F)
where
    F: Fn(usize, usize, usize) + Sync,
{
    if total == 0 || concurrency == 0 {
        return;
    }
    let step = total.div_ceil(concurrency);
    std::thread::scope(|scope| {
        for index in 0..concurrency {
            let start = (index * step).min(total);
            let end = ((index + 1) * step).min(total);
            if start >= end {
                continue;
            }
            let job = &job;
            scope.spawn(move || job(index, start, end));
        }
    });
}
