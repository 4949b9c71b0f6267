mod common;

use common::{grant, Harness, NOW};
use fieldsync_contracts::SourceTier;
use fieldsync_os::{AuthError, RuntimeError};

#[test]
fn at_cascade_01_every_reachability_combination_resolves_to_one_outcome() {
    for remote_up in [false, true] {
        for local_up in [false, true] {
            for cached in [false, true] {
                let h = Harness::new();
                h.remote_login.register("a@x.com", "pw", grant("u-1", "Ada", "tok-r"));
                h.local_login.register("a@x.com", "pw", grant("u-1", "Ada", "tok-l"));
                if cached {
                    h.runtime.login("a@x.com", "pw", NOW).unwrap();
                    h.runtime.logout();
                }
                h.remote_login.set_reachable(remote_up);
                h.local_login.set_reachable(local_up);

                let result = h.runtime.login("a@x.com", "pw", NOW);
                let expected = if remote_up {
                    Some(SourceTier::Remote)
                } else if local_up {
                    Some(SourceTier::LocalNetwork)
                } else if cached {
                    Some(SourceTier::OfflineCache)
                } else {
                    None
                };
                match (result, expected) {
                    (Ok(session), Some(tier)) => assert_eq!(session.source_tier, tier),
                    (Err(RuntimeError::Auth(AuthError::VaultMiss)), None) => {}
                    (other, tier) => panic!(
                        "remote={remote_up} local={local_up} cached={cached}: {other:?} vs {tier:?}"
                    ),
                }
            }
        }
    }
}

#[test]
fn at_cascade_02_remote_rejection_never_reaches_other_tiers() {
    let h = Harness::new();
    h.remote_login.register("a@x.com", "right", grant("u-1", "Ada", "tok-r"));
    h.local_login.register("a@x.com", "wrong", grant("u-1", "Ada", "tok-l"));

    let err = h.runtime.login("a@x.com", "wrong", NOW).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Auth(AuthError::CredentialRejected {
            tier: SourceTier::Remote
        })
    ));
    assert_eq!(h.remote_login.calls(), 1);
    assert_eq!(h.local_login.calls(), 0);
    assert!(h.runtime.sessions().current().is_none());
}

#[test]
fn at_cascade_03_offline_login_only_for_previously_seen_users() {
    let h = Harness::new();
    h.login_online("a@x.com", "pw");
    h.runtime.logout();
    h.all_logins_reachable(false);

    let session = h.runtime.login("A@x.com ", "pw", NOW).unwrap();
    assert_eq!(session.source_tier, SourceTier::OfflineCache);
    assert_eq!(session.display_name, "Ada");
    assert_eq!(session.token.expose(), "tok-1");

    assert!(matches!(
        h.runtime.login("b@x.com", "pw", NOW),
        Err(RuntimeError::Auth(AuthError::VaultMiss))
    ));
}

#[test]
fn at_cascade_04_newer_online_login_overwrites_cached_profile() {
    let h = Harness::new();
    h.remote_login.register("a@x.com", "pw", grant("u-1", "Ada", "tok-1"));
    h.runtime.login("a@x.com", "pw", NOW).unwrap();
    h.remote_login
        .register("a@x.com", "pw2", grant("u-1", "Ada Lovelace", "tok-2"));
    h.runtime.login("a@x.com", "pw2", NOW).unwrap();
    h.runtime.logout();

    h.all_logins_reachable(false);
    let session = h.runtime.login("a@x.com", "pw2", NOW).unwrap();
    assert_eq!(session.display_name, "Ada Lovelace");
    assert_eq!(session.token.expose(), "tok-2");
    assert!(matches!(
        h.runtime.login("a@x.com", "pw", NOW),
        Err(RuntimeError::Auth(AuthError::VaultMiss))
    ));
}

#[test]
fn at_cascade_05_vault_survives_restart_and_forget_device_wipes_it() {
    let h = Harness::new();
    h.login_online("a@x.com", "pw");
    let h = h.restart();
    assert!(h.runtime.sessions().current().is_none());
    h.all_logins_reachable(false);
    assert_eq!(
        h.runtime.login("a@x.com", "pw", NOW).unwrap().source_tier,
        SourceTier::OfflineCache
    );

    assert_eq!(h.runtime.forget_device().unwrap(), 1);
    assert!(h.runtime.sessions().current().is_none());
    assert!(matches!(
        h.runtime.login("a@x.com", "pw", NOW),
        Err(RuntimeError::Auth(AuthError::VaultMiss))
    ));
}

#[test]
fn at_cascade_06_logout_and_wipe_removes_only_that_users_cache() {
    let h = Harness::new();
    h.remote_login.register("a@x.com", "pw-a", grant("u-1", "Ada", "tok-a"));
    h.remote_login.register("b@x.com", "pw-b", grant("u-2", "Bob", "tok-b"));
    h.runtime.login("b@x.com", "pw-b", NOW).unwrap();
    h.runtime.login("a@x.com", "pw-a", NOW).unwrap();

    let ended = h.runtime.logout_and_wipe().unwrap().unwrap();
    assert_eq!(ended.user_id.as_str(), "u-1");
    assert!(h.runtime.sessions().current().is_none());
    assert!(h.runtime.logout_and_wipe().unwrap().is_none());

    h.all_logins_reachable(false);
    assert!(matches!(
        h.runtime.login("a@x.com", "pw-a", NOW),
        Err(RuntimeError::Auth(AuthError::VaultMiss))
    ));
    let bob = h.runtime.login("b@x.com", "pw-b", NOW).unwrap();
    assert_eq!(bob.source_tier, SourceTier::OfflineCache);
    assert_eq!(bob.user_id.as_str(), "u-2");
}
