//! Channel manager contracts across components: membership consistency,
//! presence roster agreement, authorization gating, and fan-out ordering.

use serde_json::json;
use switchboard::{AuthContext, ChannelDefinition, ChannelManager, ChannelRequest, Context};

fn manager() -> ChannelManager {
    ChannelManager::new(vec![
        ChannelDefinition::public("lobby"),
        ChannelDefinition::private("account:{id}").authorize(|req: ChannelRequest| async move {
            // Only the owning principal may join its account channel.
            let owner = req.params.get("id").cloned().unwrap_or_default();
            req.context
                .auth
                .as_ref()
                .is_some_and(|a| a.principal == owner)
        }),
        ChannelDefinition::presence("presence:game:{room}")
            .authorize(|_req| async move { true })
            .presence_data(|socket_id, ctx| {
                json!({
                    "socket": socket_id,
                    "principal": ctx.auth.as_ref().map(|a| a.principal.clone()),
                })
            }),
    ])
}

fn ctx_for(principal: &str) -> Context {
    Context::new().with_auth(AuthContext::authenticated(principal))
}

#[tokio::test]
async fn membership_follows_subscribe_unsubscribe_and_disconnect() {
    let mgr = manager();
    let _rx1 = mgr.register_socket("s1");
    let _rx2 = mgr.register_socket("s2");

    mgr.subscribe("s1", "lobby", "r1", &Context::new()).await.unwrap();
    mgr.subscribe("s2", "lobby", "r2", &Context::new()).await.unwrap();
    assert_eq!(mgr.members("lobby"), vec!["s1", "s2"]);

    mgr.unsubscribe("s1", "lobby", "r3");
    assert_eq!(mgr.members("lobby"), vec!["s2"]);

    mgr.on_disconnect("s2");
    assert!(mgr.members("lobby").is_empty());
}

#[tokio::test]
async fn account_channel_admits_only_its_owner() {
    let mgr = manager();
    let _rx = mgr.register_socket("s1");

    assert!(
        mgr.subscribe("s1", "account:alice", "r1", &ctx_for("alice"))
            .await
            .is_ok()
    );
    assert!(
        mgr.subscribe("s1", "account:bob", "r2", &ctx_for("alice"))
            .await
            .is_err()
    );
    assert_eq!(mgr.members("account:alice"), vec!["s1"]);
    assert!(mgr.members("account:bob").is_empty());
}

#[tokio::test]
async fn presence_roster_tracks_membership_exactly() {
    let mgr = manager();
    let _rx1 = mgr.register_socket("s1");
    let _rx2 = mgr.register_socket("s2");
    let _rx3 = mgr.register_socket("s3");

    for (socket, principal, req) in [("s1", "ann", "r1"), ("s2", "ben", "r2"), ("s3", "cy", "r3")] {
        mgr.subscribe(socket, "presence:game:42", req, &ctx_for(principal))
            .await
            .unwrap();
    }
    assert_eq!(mgr.members("presence:game:42"), vec!["s1", "s2", "s3"]);
    let roster = mgr.roster("presence:game:42");
    assert_eq!(roster.len(), 3);
    assert_eq!(roster["s2"]["principal"], "ben");

    mgr.on_disconnect("s2");
    assert_eq!(mgr.members("presence:game:42"), vec!["s1", "s3"]);
    let roster = mgr.roster("presence:game:42");
    assert_eq!(roster.len(), 2);
    assert!(!roster.contains_key("s2"));
}

#[tokio::test]
async fn join_leave_events_reach_existing_members_only() {
    let mgr = manager();
    let mut rx1 = mgr.register_socket("s1");
    let mut rx2 = mgr.register_socket("s2");

    mgr.subscribe("s1", "presence:game:7", "r1", &ctx_for("ann"))
        .await
        .unwrap();
    // Drain s1's ack.
    let ack = rx1.try_recv().unwrap();
    assert_eq!(ack.kind, switchboard::FrameKind::Subscribed);

    mgr.subscribe("s2", "presence:game:7", "r2", &ctx_for("ben"))
        .await
        .unwrap();
    let join = rx1.try_recv().unwrap();
    assert_eq!(join.kind, switchboard::FrameKind::PresenceJoin);
    assert_eq!(join.payload["socketId"], "s2");
    assert_eq!(join.payload["data"]["principal"], "ben");

    // The joining socket gets its ack with the roster, not its own join.
    let ack2 = rx2.try_recv().unwrap();
    assert_eq!(ack2.kind, switchboard::FrameKind::Subscribed);
    assert!(ack2.payload["members"]["s1"].is_object());
    assert!(rx2.try_recv().is_err());

    mgr.unsubscribe("s2", "presence:game:7", "r3");
    let leave = rx1.try_recv().unwrap();
    assert_eq!(leave.kind, switchboard::FrameKind::PresenceLeave);
    assert_eq!(leave.payload["socketId"], "s2");
}

#[tokio::test]
async fn publish_respects_per_event_authorization() {
    let mgr = ChannelManager::new(vec![
        ChannelDefinition::private("mod:{room}")
            .authorize(|_req| async move { true })
            .authorize_publish(|req: ChannelRequest| async move {
                req.event.as_deref() == Some("chat.message")
            }),
    ]);
    let _rx1 = mgr.register_socket("s1");
    let mut rx2 = mgr.register_socket("s2");
    mgr.subscribe("s1", "mod:1", "r1", &ctx_for("ann")).await.unwrap();
    mgr.subscribe("s2", "mod:1", "r2", &ctx_for("ben")).await.unwrap();
    while rx2.try_recv().is_ok() {}

    assert!(
        mgr.publish("s1", "mod:1", "chat.message", json!({"t": "hi"}), &ctx_for("ann"))
            .await
            .is_ok()
    );
    let err = mgr
        .publish("s1", "mod:1", "admin.kick", json!({}), &ctx_for("ann"))
        .await
        .unwrap_err();
    assert_eq!(err.code, switchboard::ErrorCode::PermissionDenied);

    let delivered: Vec<_> = std::iter::from_fn(|| rx2.try_recv().ok()).collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].event.as_deref(), Some("chat.message"));
}
