/// Logical target names understood by the engine.
pub mod targets {
    pub const POST_CONTAINER: &str = "post_container";
    pub const FEED_CONTAINER: &str = "feed_container";
    pub const POST_TEXT: &str = "post_text";
    pub const AUTHOR_NAME: &str = "author_name";
    pub const AUTHOR_AVATAR: &str = "author_avatar";
    pub const TIMESTAMP: &str = "timestamp";
    pub const PERMALINK: &str = "permalink";
    pub const SEE_MORE: &str = "see_more";
    pub const COMMENT_CONTAINER: &str = "comment_container";
    pub const COMMENT_TEXT: &str = "comment_text";
    pub const COMMENT_PERMALINK: &str = "comment_permalink";
    pub const VIEW_MORE_COMMENTS: &str = "view_more_comments";
    pub const OVERLAY: &str = "overlay";
    pub const CONSENT_BANNER: &str = "consent_banner";
    pub const CONSENT_ACCEPT: &str = "consent_accept";
    pub const NOTIFICATION_PROMPT: &str = "notification_prompt";
    pub const DISMISS_BUTTON: &str = "dismiss_button";
    pub const CLOSE_BUTTON: &str = "close_button";
    pub const AUTH_LANDMARK: &str = "auth_landmark";
    pub const LOGIN_FORM: &str = "login_form";
    pub const SKELETON: &str = "skeleton";
    pub const PRIMARY_VIEW_TAB: &str = "primary_view_tab";
}

use targets::*;

/// Built-in candidates per target, most specific first.
pub fn default_catalogue() -> &'static [(&'static str, &'static [&'static str])] {
    &[
        (
            POST_CONTAINER,
            &[
                r#"[data-pagelet^="FeedUnit"]"#,
                "div[aria-posinset]",
                r#"div[data-testid="comet_feed_unit"]"#,
                r#"div[role="feed"] div[role="article"]"#,
            ],
        ),
        (
            FEED_CONTAINER,
            &[r#"div[role="feed"]"#, r#"div[data-testid="post_scroller"]"#],
        ),
        (
            POST_TEXT,
            &[
                r#"div[data-ad-rendering-role="story_message"]"#,
                r#"div[data-ad-comet-preview="message"]"#,
                r#"div[data-ad-preview="message"]"#,
                r#"div[dir="auto"]"#,
            ],
        ),
        (
            AUTHOR_NAME,
            &[
                r#"[data-ad-rendering-role="profile_name"] a"#,
                r#"[data-ad-rendering-role="profile_name"]"#,
                "h2 strong a",
                "h3 strong a",
                "h2 strong",
                "h3 strong",
                r#"a[href*="/user/"]"#,
                r#"a[href*="/profile.php"]"#,
            ],
        ),
        (
            AUTHOR_AVATAR,
            &[
                "svg image",
                r#"img[alt*="profile picture"]"#,
                r#"img[data-imgperflogname*="profile"]"#,
            ],
        ),
        (
            TIMESTAMP,
            &[
                "abbr[title]",
                "abbr",
                r#"a[href*="/posts/"] span"#,
                r#"a[href*="/permalink/"] span"#,
                r#"a[href*="/posts/"]"#,
            ],
        ),
        (
            PERMALINK,
            &[
                r#"a[href*="/posts/"]:not([href*="comment_id"])"#,
                r#"a[href*="/permalink/"]:not([href*="comment_id"])"#,
                r#"a[href*="/videos/"]:not([href*="comment_id"])"#,
                r#"a[href*="/photos/"]:not([href*="comment_id"])"#,
                r#"a[href*="/watch/"]:not([href*="comment_id"])"#,
                r#"a[href*="/story.php"]:not([href*="comment_id"])"#,
            ],
        ),
        (
            SEE_MORE,
            &[
                r#"div[role="button"]:has-text("See more")"#,
                r#"div[role="button"]:has-text("Show more")"#,
                r#"a:has-text("See more")"#,
            ],
        ),
        (
            COMMENT_CONTAINER,
            &[
                r#"div[aria-label*="Comment by"]"#,
                r#"ul > li div[role="article"]"#,
            ],
        ),
        (
            COMMENT_TEXT,
            &[
                r#"div[dir="auto"][style*="text-align"]"#,
                r#"div[dir="auto"]"#,
                r#"span[dir="auto"]"#,
            ],
        ),
        (
            COMMENT_PERMALINK,
            &[r#"a[href*="comment_id="]"#, "[data-commentid]"],
        ),
        (
            VIEW_MORE_COMMENTS,
            &[
                r#"div[role="button"]:has-text("View more comments")"#,
                r#"div[role="button"]:has-text("View previous comments")"#,
                r#"span:has-text("View more comments")"#,
            ],
        ),
        (
            OVERLAY,
            &[
                r#"div[role="dialog"]"#,
                r#"div[aria-modal="true"]"#,
                r#"div[data-testid*="dialog"]"#,
            ],
        ),
        (
            CONSENT_BANNER,
            &[
                r#"div[data-testid="cookie-policy-manage-dialog"]"#,
                r#"div[aria-label*="cookies"]"#,
            ],
        ),
        (
            CONSENT_ACCEPT,
            &[
                r#"button[data-cookiebanner="accept_button"]"#,
                r#"[aria-label="Allow all cookies"]"#,
                r#"div[role="button"]:has-text("Allow all cookies")"#,
            ],
        ),
        (
            NOTIFICATION_PROMPT,
            &[
                r#"div[role="dialog"][aria-label*="otification"]"#,
                r#"div[role="dialog"]:has-text("Turn on notifications")"#,
            ],
        ),
        (
            DISMISS_BUTTON,
            &[
                r#"div[role="button"][aria-label="Not now"]"#,
                r#"div[aria-label="Not now"]"#,
                r#"[role="button"]:has-text("Not now")"#,
                r#"div[role="button"][aria-label="Decline optional cookies"]"#,
            ],
        ),
        (
            CLOSE_BUTTON,
            &[
                r#"div[role="button"][aria-label="Close"]"#,
                r#"button[aria-label="Close"]"#,
                r#"[aria-label="Close"]"#,
            ],
        ),
        (
            AUTH_LANDMARK,
            &[
                r#"[aria-label="Your profile"]"#,
                r#"[aria-label="Account controls and settings"]"#,
                r#"[aria-label="Account"]"#,
            ],
        ),
        (
            LOGIN_FORM,
            &[
                r#"form[data-testid="royal_login_form"]"#,
                r#"form[id="login_form"]"#,
                r#"input[name="pass"]"#,
            ],
        ),
        (
            SKELETON,
            &[
                r#"[data-visualcompletion="loading-state"]"#,
                r#"div[aria-busy="true"]"#,
            ],
        ),
        (
            PRIMARY_VIEW_TAB,
            &[
                r#"a[role="tab"][href*="/discussion"]"#,
                r#"a[role="tab"]:has-text("Discussion")"#,
                r#"div[role="tab"]:has-text("Discussion")"#,
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::Locator;
    use std::collections::HashSet;

    #[test]
    fn every_target_has_parseable_candidates() {
        let mut seen = HashSet::new();
        for (target, candidates) in default_catalogue() {
            assert!(seen.insert(*target), "duplicate target {target}");
            assert!(!candidates.is_empty(), "{target} has no candidates");
            for candidate in *candidates {
                Locator::parse(candidate).unwrap();
            }
        }
        assert!(seen.contains(POST_CONTAINER));
        assert!(seen.contains(PRIMARY_VIEW_TAB));
    }
}
