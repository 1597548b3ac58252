/// The following diagram shows the life of a single [`Counter::increment`](crate::Counter::increment)
/// call and which [`KeyedStore`](crate::KeyedStore) primitive every step relies on.
#[cfg_attr(doc, aquamarine::aquamarine)]
/// ```mermaid
/// graph TB
///     subgraph Caller
///         call[increment key]
///     end
///     subgraph Counter
///         validate{closed or empty key?}
///         ensure[ensure exists]
///         locked_read[locked read]
///         compute[current + step, wrap above rollover]
///         write[conditional write]
///         retry{retry policy allows?}
///     end
///     subgraph KeyedStore
///         read>read]
///         create>create_if_absent]
///         lock>read_and_lock]
///         cas>replace_cas]
///     end
///     call --> validate
///     validate -- yes --> fatal([error])
///     validate -- no --> ensure
///     ensure -. uses .- read
///     ensure -. uses .- create
///     ensure -- created --> absent([None])
///     ensure -- existed --> locked_read
///     locked_read -. uses .- lock
///     locked_read --> compute
///     compute --> write
///     write -. uses .- cas
///     write -- ok --> present([Some value])
///     locked_read -- Locked --> retry
///     write -- CasMismatch --> retry
///     retry -- yes --> locked_read
///     retry -- no --> fatal
///     locked_read -- NotFound --> fatal
/// ```
///
/// Key creation is serialized inside one engine by a mutex; everything else relies on the
/// store's lock and CAS token alone, which is what lets engines in separate processes share a
/// counter.
///
/// The retry edge is bounded by [`RetryPolicy`](crate::RetryPolicy): attempts, a deadline, or a
/// [`CancellationToken`](crate::CancellationToken) passed to
/// [`Counter::increment_until`](crate::Counter::increment_until).
pub struct Diagram;
