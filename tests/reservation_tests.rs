// tests/reservation_tests.rs
use std::collections::BTreeSet;
use std::sync::Arc;

use theatron::{
    Error, MemoryStore, SeatArea, ShowTicketDao, ShowTicketService, Ticket, TicketStatus,
};

const SHOW_ID: &str = "42aa09ef-7533-4434-8360-0115eafe43b8";

fn setup() -> Arc<ShowTicketService> {
    let store = Arc::new(
        MemoryStore::new(ShowTicketDao::key_schema())
            .with_index(ShowTicketDao::reference_index()),
    );
    Arc::new(ShowTicketService::new(store))
}

async fn seed_tickets(service: &ShowTicketService, ticket_ids: &[&str]) {
    for ticket_id in ticket_ids {
        service
            .dao()
            .save_ticket(&Ticket::available(SHOW_ID, *ticket_id, SeatArea::Stalls, 50.0))
            .await
            .unwrap();
    }
}

fn ids(ticket_ids: &[&str]) -> BTreeSet<String> {
    ticket_ids.iter().map(|id| id.to_string()).collect()
}

#[tokio::test]
async fn reserve_stamps_the_generated_reference() {
    let service = setup();
    seed_tickets(&service, &["A1"]).await;

    let reference = service.reserve_ticket(SHOW_ID, "A1").await.unwrap();

    let ticket = service.find_ticket(SHOW_ID, "A1").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Reserved);
    assert_eq!(ticket.reference.as_deref(), Some(reference.as_str()));
}

#[tokio::test]
async fn reserve_conflicts_on_a_taken_ticket() {
    let service = setup();
    seed_tickets(&service, &["A1"]).await;

    service.reserve_ticket(SHOW_ID, "A1").await.unwrap();
    let err = service.reserve_ticket(SHOW_ID, "A1").await.unwrap_err();
    assert!(matches!(err, Error::ReservationConflict));
}

#[tokio::test]
async fn reserve_conflicts_on_an_unknown_ticket() {
    let service = setup();
    // No read precedes the conditional write, so a missing ticket is
    // indistinguishable from a taken one.
    let err = service.reserve_ticket(SHOW_ID, "GHOST").await.unwrap_err();
    assert!(matches!(err, Error::ReservationConflict));
}

#[tokio::test]
async fn concurrent_reserves_have_exactly_one_winner() {
    let service = setup();
    seed_tickets(&service, &["A1"]).await;

    let first = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.reserve_ticket(SHOW_ID, "A1").await })
    };
    let second = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.reserve_ticket(SHOW_ID, "A1").await })
    };

    let outcomes = [first.await.unwrap(), second.await.unwrap()];
    let won: Vec<&String> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(won.len(), 1, "exactly one reservation must win");
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(Error::ReservationConflict))));

    let ticket = service.find_ticket(SHOW_ID, "A1").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Reserved);
    assert_eq!(ticket.reference.as_ref(), Some(won[0]));
}

#[tokio::test]
async fn batch_reservation_is_all_or_nothing() {
    let service = setup();
    seed_tickets(&service, &["A1", "A2", "A3"]).await;

    let holder = service.reserve_ticket(SHOW_ID, "A2").await.unwrap();

    let err = service
        .reserve_tickets(SHOW_ID, &ids(&["A1", "A2", "A3"]), "batch-ref", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransactionAborted));

    // Every ticket keeps its pre-call state.
    let a1 = service.find_ticket(SHOW_ID, "A1").await.unwrap().unwrap();
    let a2 = service.find_ticket(SHOW_ID, "A2").await.unwrap().unwrap();
    let a3 = service.find_ticket(SHOW_ID, "A3").await.unwrap().unwrap();
    assert_eq!(a1.status, TicketStatus::Available);
    assert_eq!(a1.reference, None);
    assert_eq!(a2.status, TicketStatus::Reserved);
    assert_eq!(a2.reference.as_deref(), Some(holder.as_str()));
    assert_eq!(a3.status, TicketStatus::Available);
    assert_eq!(a3.reference, None);
}

#[tokio::test]
async fn batch_reservation_succeeds_atomically() {
    let service = setup();
    seed_tickets(&service, &["A1", "A2", "A3"]).await;

    service
        .reserve_tickets(SHOW_ID, &ids(&["A1", "A2"]), "batch-ref", None)
        .await
        .unwrap();

    for ticket_id in ["A1", "A2"] {
        let ticket = service
            .find_ticket(SHOW_ID, ticket_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::Reserved);
        assert_eq!(ticket.reference.as_deref(), Some("batch-ref"));
    }
    let a3 = service.find_ticket(SHOW_ID, "A3").await.unwrap().unwrap();
    assert_eq!(a3.status, TicketStatus::Available);
}

#[tokio::test]
async fn identical_resubmission_replays_the_original_success() {
    let service = setup();
    seed_tickets(&service, &["A1", "A2"]).await;

    let tickets = ids(&["A1", "A2"]);
    service
        .reserve_tickets(SHOW_ID, &tickets, "ref-1", Some("token-1"))
        .await
        .unwrap();

    // The retry arrives after the first call already committed; it must
    // succeed without re-processing anything.
    service
        .reserve_tickets(SHOW_ID, &tickets, "ref-1", Some("token-1"))
        .await
        .unwrap();

    for ticket_id in ["A1", "A2"] {
        let ticket = service
            .find_ticket(SHOW_ID, ticket_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::Reserved);
        assert_eq!(ticket.reference.as_deref(), Some("ref-1"));
    }
}

#[tokio::test]
async fn token_reuse_for_a_different_set_is_rejected() {
    let service = setup();
    seed_tickets(&service, &["A1", "A2", "C1"]).await;

    service
        .reserve_tickets(SHOW_ID, &ids(&["A1", "A2"]), "ref-1", Some("token-1"))
        .await
        .unwrap();

    let err = service
        .reserve_tickets(SHOW_ID, &ids(&["C1"]), "ref-1", Some("token-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IdempotencyConflict));

    let c1 = service.find_ticket(SHOW_ID, "C1").await.unwrap().unwrap();
    assert_eq!(c1.status, TicketStatus::Available);
}

#[tokio::test]
async fn release_clears_the_reference_and_allows_re_reservation() {
    let service = setup();
    seed_tickets(&service, &["A1"]).await;

    let first = service.reserve_ticket(SHOW_ID, "A1").await.unwrap();
    service.release_ticket(SHOW_ID, "A1").await.unwrap();

    let ticket = service.find_ticket(SHOW_ID, "A1").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Available);
    assert_eq!(ticket.reference, None);

    let second = service.reserve_ticket(SHOW_ID, "A1").await.unwrap();
    assert_ne!(first, second);

    let ticket = service.find_ticket(SHOW_ID, "A1").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Reserved);
    assert_eq!(ticket.reference.as_deref(), Some(second.as_str()));
}

#[tokio::test]
async fn release_is_idempotent() {
    let service = setup();
    seed_tickets(&service, &["A1"]).await;

    // Already available: no-op, not an error.
    service.release_ticket(SHOW_ID, "A1").await.unwrap();
    // Never existed: also a no-op, and no phantom record appears.
    service.release_ticket(SHOW_ID, "GHOST").await.unwrap();
    assert!(service.find_ticket(SHOW_ID, "GHOST").await.unwrap().is_none());
}

#[tokio::test]
async fn batch_size_is_bounded() {
    let service = setup();

    let too_many: BTreeSet<String> = (0..26).map(|i| format!("S{:02}", i)).collect();
    let err = service
        .reserve_tickets(SHOW_ID, &too_many, "ref-1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let none = BTreeSet::new();
    let err = service
        .reserve_tickets(SHOW_ID, &none, "ref-1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}
