//! Pure permission evaluation (spec §4.E). No I/O, no store access — the
//! ingestion controller feeds it plain data extracted from the in-memory
//! mirror. Same small-bitset-newtype idiom as `CallReducerFlags` in
//! `client-api-messages`, layered on [`archive_types::Permissions`].

use archive_types::Permissions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteKind {
    Role,
    Member,
}

#[derive(Debug, Clone, Copy)]
pub struct Overwrite {
    pub id: u64,
    pub kind: OverwriteKind,
    pub allow: Permissions,
    pub deny: Permissions,
}

/// Parses the upstream's decimal-string permission bitset representation.
/// Malformed input (never observed in practice) is treated as no
/// permissions rather than panicking.
pub fn parse_permissions(raw: &str) -> Permissions {
    Permissions(raw.parse().unwrap_or(0))
}

/// `guild_permissions(account, guild, role_ids)` (spec §4.E). The owner
/// always has every permission; otherwise OR the `@everyone` role with
/// every role the account holds, short-circuiting to `ALL` if the result
/// carries `ADMINISTRATOR`.
pub fn guild_permissions(account_id: u64, owner_id: u64, everyone_permissions: Permissions, account_role_permissions: &[Permissions]) -> Permissions {
    if account_id == owner_id {
        return Permissions::ALL;
    }
    let mut perms = everyone_permissions;
    for role in account_role_permissions {
        perms |= *role;
    }
    if perms.has(Permissions::ADMINISTRATOR) {
        return Permissions::ALL;
    }
    perms
}

/// `channel_permissions(account, guild, channel, account_data)` (spec
/// §4.E). Starts from `guild_permissions`, then applies overwrites in
/// order: the `@everyone` overwrite, the OR of every role overwrite
/// matching one of the account's roles (denies merged before allows), then
/// the account-specific overwrite.
pub fn channel_permissions(
    account_id: u64,
    owner_id: u64,
    guild_perms: Permissions,
    account_role_ids: &[u64],
    overwrites: &[Overwrite],
) -> Permissions {
    if account_id == owner_id {
        return Permissions::ALL;
    }
    if guild_perms.has(Permissions::ADMINISTRATOR) {
        return Permissions::ALL;
    }

    let mut perms = guild_perms;

    if let Some(everyone) = overwrites.iter().find(|o| o.kind == OverwriteKind::Role && o.id == 0) {
        perms = perms.deny(everyone.deny);
        perms |= everyone.allow;
    }

    let mut role_deny = Permissions::NONE;
    let mut role_allow = Permissions::NONE;
    for ow in overwrites
        .iter()
        .filter(|o| o.kind == OverwriteKind::Role && o.id != 0 && account_role_ids.contains(&o.id))
    {
        role_deny |= ow.deny;
        role_allow |= ow.allow;
    }
    perms = perms.deny(role_deny);
    perms |= role_allow;

    if let Some(member) = overwrites.iter().find(|o| o.kind == OverwriteKind::Member && o.id == account_id) {
        perms = perms.deny(member.deny);
        perms |= member.allow;
    }

    perms
}

pub fn has(perms: Permissions, flag: Permissions) -> bool {
    perms.has(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_always_has_all_permissions() {
        let p = guild_permissions(1, 1, Permissions::NONE, &[]);
        assert_eq!(p, Permissions::ALL);
    }

    #[test]
    fn administrator_role_short_circuits_to_all() {
        let p = guild_permissions(2, 1, Permissions::NONE, &[Permissions::ADMINISTRATOR]);
        assert_eq!(p, Permissions::ALL);
    }

    #[test]
    fn everyone_role_is_unioned_with_account_roles() {
        let p = guild_permissions(2, 1, Permissions::VIEW_CHANNEL, &[Permissions::MANAGE_THREADS]);
        assert!(p.has(Permissions::VIEW_CHANNEL));
        assert!(p.has(Permissions::MANAGE_THREADS));
    }

    #[test]
    fn channel_overwrite_order_everyone_then_role_then_member() {
        let guild_perms = Permissions::VIEW_CHANNEL | Permissions::MANAGE_THREADS;
        let overwrites = vec![
            Overwrite {
                id: 0,
                kind: OverwriteKind::Role,
                allow: Permissions::NONE,
                deny: Permissions::VIEW_CHANNEL,
            },
            Overwrite {
                id: 10,
                kind: OverwriteKind::Role,
                allow: Permissions::VIEW_CHANNEL,
                deny: Permissions::NONE,
            },
        ];
        let p = channel_permissions(2, 1, guild_perms, &[10], &overwrites);
        assert!(p.has(Permissions::VIEW_CHANNEL));
    }

    #[test]
    fn member_overwrite_wins_over_role_overwrite() {
        let guild_perms = Permissions::VIEW_CHANNEL;
        let overwrites = vec![
            Overwrite {
                id: 10,
                kind: OverwriteKind::Role,
                allow: Permissions::NONE,
                deny: Permissions::NONE,
            },
            Overwrite {
                id: 2,
                kind: OverwriteKind::Member,
                allow: Permissions::NONE,
                deny: Permissions::VIEW_CHANNEL,
            },
        ];
        let p = channel_permissions(2, 1, guild_perms, &[10], &overwrites);
        assert!(!p.has(Permissions::VIEW_CHANNEL));
    }

    #[test]
    fn administrator_channel_permissions_bypasses_overwrites() {
        let overwrites = vec![Overwrite {
            id: 0,
            kind: OverwriteKind::Role,
            allow: Permissions::NONE,
            deny: Permissions::VIEW_CHANNEL,
        }];
        let p = channel_permissions(2, 1, Permissions::ADMINISTRATOR, &[], &overwrites);
        assert_eq!(p, Permissions::ALL);
    }

    #[test]
    fn parse_permissions_treats_malformed_input_as_none() {
        assert_eq!(parse_permissions("not-a-number"), Permissions::NONE);
        assert_eq!(parse_permissions("1024"), Permissions::VIEW_CHANNEL);
    }
}
