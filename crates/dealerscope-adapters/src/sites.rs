//! Locator scripts and result parsers for the Kia, Opel and Seat dealer search pages.

use std::time::Duration;

use dealerscope_core::{RawDealerTuple, Source};
use scraper::{ElementRef, Html, Selector};

use crate::{
    AdapterError, LocatorScript, Pagination, Scope, ScriptStep, StepAction, DEFAULT_MAX_PAGES,
    DEFAULT_POLL_INTERVAL,
};

const KIA_URL: &str = "https://www.kia.com/de/haendlersuche/";
const OPEL_URL: &str = "https://www.opel.de/tools/haendlersuche.html";
const SEAT_URL: &str = "https://www.seat.de/kontakt/haendlersuche";

const SEAT_FRAME: &str = "#iFrameResizer0";

const KIA_LIST_VIEW: &str = r#"(() => {
  const button = Array.from(document.querySelectorAll("button"))
    .find((b) => b.textContent.trim() === "Listenansicht");
  if (!button) return false;
  button.click();
  return true;
})()"#;

const SCROLL_TO_BOTTOM: &str = r#"(() => {
  window.scrollTo(0, document.body.scrollHeight);
  return true;
})()"#;

pub fn kia_script() -> LocatorScript {
    LocatorScript {
        source: Source::Kia,
        steps: vec![
            ScriptStep::required("open-locator", StepAction::Navigate(KIA_URL), Duration::from_secs(30)),
            ScriptStep::dismiss("cookie-consent", Scope::Document, "#onetrust-accept-btn-handler"),
            ScriptStep::dismiss(
                "promo-popup",
                Scope::Document,
                ".bbapp-global-popup__container .bbapp-global-popup__close",
            ),
            ScriptStep::required(
                "search-term",
                StepAction::TypeTerm {
                    scope: Scope::Document,
                    selector: "input.dealer-search__input",
                },
                Duration::from_secs(15),
            ),
            ScriptStep::required(
                "submit-search",
                StepAction::Click {
                    scope: Scope::Document,
                    selector: "button.dealer-search__submit",
                },
                Duration::from_secs(5),
            ),
            ScriptStep::optional("list-view", StepAction::Script(KIA_LIST_VIEW), Duration::from_secs(5)),
        ],
        results_scope: Scope::Document,
        results_selector: "li.dealers-list-item",
        results_timeout: Duration::from_secs(15),
        pagination: Pagination::NextPage {
            next: "ul.eut_pagination li.next a",
            disabled: "ul.eut_pagination li.next a.disabled",
        },
        settle: Duration::from_secs(3),
        max_pages: DEFAULT_MAX_PAGES,
        poll_interval: DEFAULT_POLL_INTERVAL,
        parse: parse_kia_page,
    }
}

pub fn opel_script() -> LocatorScript {
    LocatorScript {
        source: Source::Opel,
        steps: vec![
            ScriptStep::required("open-locator", StepAction::Navigate(OPEL_URL), Duration::from_secs(30)),
            ScriptStep::optional(
                "cookie-consent",
                StepAction::Click {
                    scope: Scope::Document,
                    selector: "#_psaihm_refuse_all",
                },
                Duration::from_secs(10),
            ),
            ScriptStep::optional(
                "clear-search",
                StepAction::Click {
                    scope: Scope::Document,
                    selector: ".clear-searchbox",
                },
                Duration::from_millis(500),
            ),
            ScriptStep::required(
                "search-term",
                StepAction::TypeTerm {
                    scope: Scope::Document,
                    selector: "#dealerSearchBox",
                },
                Duration::from_secs(15),
            ),
            ScriptStep::required(
                "pick-locality",
                StepAction::Click {
                    scope: Scope::Document,
                    selector: ".localities-container .localities-item:first-child",
                },
                Duration::from_secs(10),
            ),
            ScriptStep::required(
                "submit-search",
                StepAction::Click {
                    scope: Scope::Document,
                    selector: ".dealer-search-button.stat-search-submit",
                },
                Duration::from_secs(10),
            ),
        ],
        results_scope: Scope::Document,
        results_selector: "li.q-dealer-info h5.q-dealer-name",
        results_timeout: Duration::from_secs(15),
        pagination: Pagination::LoadMore {
            selector: "a.q-button.expand",
        },
        settle: Duration::from_secs(2),
        max_pages: DEFAULT_MAX_PAGES,
        poll_interval: DEFAULT_POLL_INTERVAL,
        parse: parse_opel_page,
    }
}

pub fn seat_script() -> LocatorScript {
    let frame = Scope::Frame(SEAT_FRAME);
    LocatorScript {
        source: Source::Seat,
        steps: vec![
            ScriptStep::required("open-locator", StepAction::Navigate(SEAT_URL), Duration::from_secs(30)),
            ScriptStep::dismiss("cookie-consent", Scope::Document, "#onetrust-reject-all-handler"),
            ScriptStep::optional("scroll-to-widget", StepAction::Script(SCROLL_TO_BOTTOM), Duration::from_secs(1)),
            ScriptStep::pause("widget-settle", Duration::from_secs(3)),
            // The locator iframe frequently renders blank on the first load.
            ScriptStep::required("reload", StepAction::Reload, Duration::from_secs(30)),
            ScriptStep::pause("reload-settle", Duration::from_secs(3)),
            ScriptStep::required(
                "locator-frame",
                StepAction::WaitFor {
                    scope: Scope::Document,
                    selector: SEAT_FRAME,
                },
                Duration::from_secs(10),
            ),
            ScriptStep::dismiss("frame-consent", frame.clone(), "#onetrust-accept-btn-handler"),
            ScriptStep::optional(
                "frame-cookie-notice",
                StepAction::Click {
                    scope: frame.clone(),
                    selector: "#acceptCookie",
                },
                Duration::from_secs(7),
            ),
            ScriptStep::required(
                "search-term",
                StepAction::TypeTerm {
                    scope: frame.clone(),
                    selector: "#filter",
                },
                Duration::from_secs(15),
            ),
            ScriptStep::pause("suggestions-settle", Duration::from_secs(1)),
            ScriptStep::required(
                "submit-search",
                StepAction::Click {
                    scope: frame.clone(),
                    selector: "#button-search",
                },
                Duration::from_secs(5),
            ),
        ],
        results_scope: frame,
        results_selector: "div#dealerList > div.dealer",
        results_timeout: Duration::from_secs(15),
        pagination: Pagination::None,
        settle: Duration::from_secs(1),
        max_pages: DEFAULT_MAX_PAGES,
        poll_interval: DEFAULT_POLL_INTERVAL,
        parse: parse_seat_page,
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("{css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(element: ElementRef<'_>, sel: &Selector) -> Option<String> {
    element.select(sel).next().and_then(element_text)
}

fn select_all_texts(element: ElementRef<'_>, sel: &Selector) -> Vec<String> {
    element.select(sel).filter_map(element_text).collect()
}

fn select_first_attr(element: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

pub fn parse_kia_page(html: &str) -> Result<Vec<RawDealerTuple>, AdapterError> {
    let document = Html::parse_document(html);
    let item = selector("li.dealers-list-item")?;
    let name = selector("div.title")?;
    let address = selector("dl.eut_info_area dd")?;
    let phone = selector("dl.bdnone dd")?;
    let website = selector("ul.right_area a.dealer_website_link")?;
    let services = selector("div.vertical_line ul.blt_list li")?;

    Ok(document
        .select(&item)
        .map(|dealer| {
            let lines = select_all_texts(dealer, &address);
            RawDealerTuple {
                name: select_first_text(dealer, &name),
                street: lines.first().cloned(),
                postal_code_city: lines.get(1).cloned(),
                phone: select_first_text(dealer, &phone)
                    .and_then(|p| text_or_none(p.replace("Telefon:", ""))),
                website: select_first_attr(dealer, &website, "href"),
                services: select_all_texts(dealer, &services),
                ..Default::default()
            }
        })
        .collect())
}

pub fn parse_opel_page(html: &str) -> Result<Vec<RawDealerTuple>, AdapterError> {
    let document = Html::parse_document(html);
    let item = selector("li.q-dealer-info")?;
    let name = selector("h5.q-dealer-name")?;
    let street = selector("p[ng-if*='addressLine1']")?;
    let locality = selector("p[ng-if*='formattedAddress']")?;
    let phone = selector("a.phone")?;
    let website = selector("a.web")?;

    Ok(document
        .select(&item)
        .map(|dealer| {
            // Rendered as "City, 12345".
            let (city, postal_code) = match select_first_text(dealer, &locality) {
                Some(text) => match text.split_once(',') {
                    Some((city, postal)) => (text_or_none(city.into()), text_or_none(postal.into())),
                    None => (Some(text), None),
                },
                None => (None, None),
            };
            RawDealerTuple {
                name: select_first_text(dealer, &name),
                street: select_first_text(dealer, &street),
                postal_code,
                city,
                phone: select_first_text(dealer, &phone),
                website: select_first_attr(dealer, &website, "href"),
                ..Default::default()
            }
        })
        .collect())
}

pub fn parse_seat_page(html: &str) -> Result<Vec<RawDealerTuple>, AdapterError> {
    let document = Html::parse_document(html);
    let item = selector("div#dealerList > div.dealer")?;
    let name = selector("div.dealerName")?;
    let address = selector("div.dealerAdress p.mb-0")?;
    let contact = selector("div.dealerContact p")?;
    let link = selector("a")?;
    let features = selector(".dealerFeatures img")?;

    Ok(document
        .select(&item)
        .map(|dealer| {
            // Street and "PLZ City" are separated by a <br> in the last address paragraph.
            let lines: Vec<String> = dealer
                .select(&address)
                .last()
                .map(|p| p.text().filter_map(|t| text_or_none(t.to_string())).collect())
                .unwrap_or_default();
            let contacts: Vec<ElementRef<'_>> = dealer.select(&contact).collect();
            let contact_text = |index: usize| {
                contacts
                    .get(index)
                    .and_then(|p| select_first_text(*p, &link))
            };
            RawDealerTuple {
                name: select_first_text(dealer, &name),
                street: lines.first().cloned(),
                postal_code_city: lines.get(1).cloned(),
                phone: contact_text(0),
                email: contact_text(1),
                website: contacts
                    .get(2)
                    .and_then(|p| select_first_attr(*p, &link, "href")),
                services: dealer
                    .select(&features)
                    .filter_map(|img| img.value().attr("title"))
                    .filter_map(|t| text_or_none(t.to_string()))
                    .collect(),
                ..Default::default()
            }
        })
        .collect())
}
