//! Stress tests for the claim protocol.
//!
//! Many users join at once against one store. Whatever interleaving the
//! scheduler picks, every user must end up either waiting or in exactly one
//! session, and no ticket may be claimed twice.

#[cfg(test)]
mod stress_tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;

    use crate::clock::{Clock, ManualClock};
    use crate::config::{AppendMode, MatchConfig};
    use crate::matchmaker::{JoinOutcome, Matchmaker};
    use crate::model::{SessionStatus, UserId, WaitingTicket};
    use crate::session::{LeaveOutcome, SessionService};
    use crate::store::{DocumentStore, InMemoryStore};

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn users(prefix: &str, count: usize) -> Vec<UserId> {
        let mut users: Vec<_> = (0..count)
            .map(|i| UserId::new(format!("{}-{:03}", prefix, i)))
            .collect();
        fastrand::shuffle(&mut users);
        users
    }

    async fn join_all_users(store: &InMemoryStore, clock: &ManualClock, users: &[UserId]) -> Vec<JoinOutcome> {
        let matchmaker = Matchmaker::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            MatchConfig::default(),
        );

        let handles: Vec<_> = users
            .iter()
            .cloned()
            .map(|user| {
                let matchmaker = matchmaker.clone();
                tokio::spawn(async move { matchmaker.join(&user).await })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.expect("join task panicked").expect("join failed"))
            .collect()
    }

    /// Every user is in exactly one of: the waiting list, one session.
    fn assert_exactly_one_place(store: &InMemoryStore, users: &[UserId]) {
        let tickets = store.tickets();
        let sessions = store.sessions();

        let mut places: HashMap<&UserId, usize> = HashMap::new();
        for ticket in &tickets {
            *places.entry(&ticket.user_id).or_default() += 1;
        }
        for session in &sessions {
            assert_ne!(
                session.participant_a, session.participant_b,
                "self-paired session {}",
                session.id
            );
            *places.entry(&session.participant_a).or_default() += 1;
            *places.entry(&session.participant_b).or_default() += 1;
        }

        for user in users {
            assert_eq!(
                places.get(user).copied().unwrap_or(0),
                1,
                "user {} is in {} places",
                user,
                places.get(user).copied().unwrap_or(0)
            );
        }
        assert_eq!(tickets.len() + 2 * sessions.len(), users.len());
    }

    // ==========================================================================
    // Tests
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_concurrent_joins_place_everyone_once() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let users = users("user", 64);

        let outcomes = join_all_users(&store, &clock, &users).await;

        let paired = outcomes
            .iter()
            .filter(|o| matches!(o, JoinOutcome::Paired { .. }))
            .count();
        assert_eq!(paired, store.sessions().len());
        assert_exactly_one_place(&store, &users);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_repeated_rounds_drain_the_queue() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let users = users("round", 32);

        // First round: everybody joins at once.
        join_all_users(&store, &clock, &users).await;
        assert_exactly_one_place(&store, &users);

        // Late arrivals one at a time always find someone while anyone waits.
        let latecomers: Vec<_> = (0..store.tickets().len())
            .map(|i| UserId::new(format!("late-{:03}", i)))
            .collect();
        let matchmaker = Matchmaker::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            MatchConfig::default(),
        );
        for user in &latecomers {
            let outcome = matchmaker.join(user).await.unwrap();
            assert!(matches!(outcome, JoinOutcome::Paired { .. }), "{} was not paired", user);
        }

        assert!(store.tickets().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_ghosts_are_never_claimed() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let ghosts = users("ghost", 8);
        for ghost in &ghosts {
            store
                .put_ticket(WaitingTicket::new(ghost.clone(), clock.now()))
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(60));

        let live = users("live", 24);
        join_all_users(&store, &clock, &live).await;

        for session in store.sessions() {
            assert!(!ghosts.contains(&session.participant_a));
            assert!(!ghosts.contains(&session.participant_b));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_everyone_leaves_and_every_session_ends() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let users = users("leaver", 40);
        join_all_users(&store, &clock, &users).await;

        let service = SessionService::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            AppendMode::ReadModifyWrite,
        );
        let mut leaves = Vec::new();
        for session in store.sessions() {
            for user in [session.participant_a.clone(), session.participant_b.clone()] {
                let service = service.clone();
                let id = session.id.clone();
                leaves.push(tokio::spawn(async move { service.leave(&id, &user).await }));
            }
        }
        fastrand::shuffle(&mut leaves);

        for outcome in join_all(leaves).await {
            let outcome = outcome.expect("leave task panicked").expect("leave failed");
            assert!(matches!(outcome, LeaveOutcome::Left { .. }));
        }

        for session in store.sessions() {
            assert!(session.left_a && session.left_b);
            assert_eq!(session.status, SessionStatus::Ended, "session {} still active", session.id);
        }
    }
}
