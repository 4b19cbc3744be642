use super::*;

struct FixedTabs(Vec<BrowserTab>);

#[async_trait]
impl TabQuery for FixedTabs {
    async fn active_tabs(&self) -> Vec<BrowserTab> {
        self.0.clone()
    }
}

fn tab(url: Option<&str>) -> BrowserTab {
    BrowserTab { id: Some(3), title: Some("Dapp".into()), url: url.map(str::to_owned) }
}

#[test]
fn environment_round_trips_through_strings() {
    for env in [
        EnvironmentType::Popup,
        EnvironmentType::Notification,
        EnvironmentType::Fullscreen,
        EnvironmentType::Background,
    ] {
        assert_eq!(env.to_string().parse::<EnvironmentType>(), Ok(env));
    }
    assert_eq!(" Popup ".parse::<EnvironmentType>(), Ok(EnvironmentType::Popup));
    assert!("sidebar".parse::<EnvironmentType>().is_err());
}

#[test]
fn https_tab_exposes_origin_and_protocol() {
    let active = ActiveTab::from_browser_tab(&tab(Some("https://app.example.org:8443/swap?x=1"))).expect("tab");
    assert_eq!(active.origin, "https://app.example.org:8443");
    assert_eq!(active.protocol, "https:");
    assert_eq!(active.url, "https://app.example.org:8443/swap?x=1");
    assert_eq!(active.id, Some(3));
}

#[test]
fn opaque_or_missing_urls_yield_no_tab() {
    assert_eq!(ActiveTab::from_browser_tab(&tab(None)), None);
    assert_eq!(ActiveTab::from_browser_tab(&tab(Some("about:blank"))), None);
    assert_eq!(ActiveTab::from_browser_tab(&tab(Some("data:text/plain,hi"))), None);
    assert_eq!(ActiveTab::from_browser_tab(&tab(Some("not a url"))), None);
}

#[tokio::test]
async fn only_popup_queries_tabs() {
    let tabs = FixedTabs(vec![tab(Some("https://example.org/"))]);

    let popup = resolve_active_tab(EnvironmentType::Popup, &tabs).await;
    assert_eq!(popup.map(|t| t.origin), Some("https://example.org".to_owned()));

    for env in [EnvironmentType::Notification, EnvironmentType::Fullscreen, EnvironmentType::Background] {
        assert_eq!(resolve_active_tab(env, &tabs).await, None);
    }
}

#[tokio::test]
async fn popup_without_tabs_has_no_active_tab() {
    assert_eq!(resolve_active_tab(EnvironmentType::Popup, &FixedTabs(vec![])).await, None);
}
