//! Authorization rules consulted before an event is accepted.

use tessera_common::models::{JoinRule, Membership, RoomEvent, event as event_types};
use tessera_common::{RoomVersion, TesseraError, TesseraResult};

use crate::storage::RoomState;

/// The first room version with the `knock` join rule.
const KNOCK_MIN_VERSION: u32 = 7;

/// What an auth check may look at.
pub struct AuthContext<'a> {
    pub room_version: &'a RoomVersion,
    pub state: &'a RoomState,
    pub sender_membership: Option<Membership>,
    /// Current membership of the `state_key` user, for member events.
    pub target_membership: Option<Membership>,
}

/// Policy deciding whether an event may enter a room. Rejections are `Forbidden`.
pub trait AuthRules: Send + Sync {
    fn check(&self, ctx: &AuthContext<'_>, event: &RoomEvent) -> TesseraResult<()>;
}

/// Membership and state rules shared by the supported room versions.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardAuthRules;

fn supports_knock(version: &RoomVersion) -> bool {
    version.number().is_some_and(|n| n >= KNOCK_MIN_VERSION)
}

impl StandardAuthRules {
    fn check_member(&self, ctx: &AuthContext<'_>, event: &RoomEvent, target: &str) -> TesseraResult<()> {
        let membership = event
            .membership_value()
            .ok_or_else(|| TesseraError::validation("m.room.member event without a valid membership"))?;
        let own = event.sender == target;

        match membership {
            Membership::Join => {
                if !own {
                    return Err(TesseraError::forbidden("cannot join on behalf of another user"));
                }
                match ctx.target_membership {
                    Some(Membership::Ban) => Err(TesseraError::forbidden("user is banned from the room")),
                    Some(Membership::Join) => Ok(()),
                    Some(Membership::Invite) => Ok(()),
                    _ if ctx.state.join_rule == JoinRule::Public => Ok(()),
                    _ => Err(TesseraError::forbidden("room is not public and user is not invited")),
                }
            }
            Membership::Leave => {
                if own {
                    match ctx.target_membership {
                        Some(Membership::Join | Membership::Invite | Membership::Knock) => Ok(()),
                        _ => Err(TesseraError::forbidden("user is not in the room")),
                    }
                } else if ctx.sender_membership != Some(Membership::Join) {
                    Err(TesseraError::forbidden("sender is not in the room"))
                } else {
                    match ctx.target_membership {
                        Some(Membership::Join | Membership::Invite | Membership::Knock) => Ok(()),
                        _ => Err(TesseraError::forbidden("target is not in the room")),
                    }
                }
            }
            Membership::Invite => {
                if ctx.sender_membership != Some(Membership::Join) {
                    return Err(TesseraError::forbidden("inviter is not in the room"));
                }
                match ctx.target_membership {
                    Some(Membership::Join) => Err(TesseraError::forbidden("invitee is already in the room")),
                    Some(Membership::Ban) => Err(TesseraError::forbidden("invitee is banned from the room")),
                    _ => Ok(()),
                }
            }
            Membership::Ban => {
                if ctx.sender_membership != Some(Membership::Join) {
                    return Err(TesseraError::forbidden("sender is not in the room"));
                }
                Ok(())
            }
            Membership::Knock => {
                if !supports_knock(ctx.room_version) {
                    return Err(TesseraError::forbidden(format!(
                        "knocking is not available in room version {}",
                        ctx.room_version
                    )));
                }
                if !own {
                    return Err(TesseraError::forbidden("cannot knock on behalf of another user"));
                }
                if ctx.state.join_rule != JoinRule::Knock {
                    return Err(TesseraError::forbidden("room does not accept knocks"));
                }
                match ctx.target_membership {
                    Some(Membership::Ban | Membership::Join) => {
                        Err(TesseraError::forbidden("user cannot knock in their current state"))
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

impl AuthRules for StandardAuthRules {
    fn check(&self, ctx: &AuthContext<'_>, event: &RoomEvent) -> TesseraResult<()> {
        match (event.event_type.as_str(), event.state_key.as_deref()) {
            (event_types::CREATE, _) => Err(TesseraError::forbidden("room already exists")),
            (event_types::MEMBER, Some(target)) => self.check_member(ctx, event, target),
            (event_types::MEMBER, None) => Err(TesseraError::validation("m.room.member event without a state key")),
            (event_type, _) => {
                if ctx.sender_membership != Some(Membership::Join) {
                    return Err(TesseraError::forbidden("sender is not in the room"));
                }
                if event_type == event_types::JOIN_RULES
                    && event.content.get("join_rule").and_then(|v| v.as_str()) == Some("knock")
                    && !supports_knock(ctx.room_version)
                {
                    return Err(TesseraError::forbidden(format!(
                        "the knock join rule is not available in room version {}",
                        ctx.room_version
                    )));
                }
                Ok(())
            }
        }
    }
}
