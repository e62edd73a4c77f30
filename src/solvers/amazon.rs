//! Amazon rate-limit captcha parser.
//!
//! Amazon's interstitial has a "Continue shopping" link or a form with
//! hidden inputs. No JS challenge, no image CAPTCHA — just parse and
//! follow. The parsed target must resolve to a known Amazon TLD; anything
//! else is rejected so a hostile page cannot redirect the session.

use http::Method;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

static AMAZON_DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|\.)(?:amazon|amzn)\.(?:com|ca|co\.uk|de|fr|it|es|co\.jp|com\.au|in|com\.br|com\.mx|nl|sg|sa|ae|eg|pl|se|tr|to|com\.be|cn|com\.tr|com\.sg)$",
    )
    .expect("amazon domain regex")
});

static LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("anchor selector"));
static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("form").expect("form selector"));
static INPUT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("input[name]").expect("input selector"));

fn is_amazon_domain(url: &Url) -> bool {
    url.host_str()
        .is_some_and(|host| AMAZON_DOMAIN_RE.is_match(host))
}

/// Follow-up request extracted from an Amazon captcha page.
#[derive(Debug, Clone)]
pub struct AmazonSolveTarget {
    pub method: Method,
    pub url: Url,
    pub params: Vec<(String, String)>,
}

/// Parse an Amazon captcha page into the request that clears it, or `None`
/// if the page is unrecognized or the target is not an Amazon domain.
pub fn parse_amazon_captcha(body: &str, page_url: &Url) -> Option<AmazonSolveTarget> {
    let document = Html::parse_document(body);

    // Strategy 1: "Continue shopping" link
    for link in document.select(&LINK_SELECTOR) {
        let text: String = link.text().collect();
        if !text.to_lowercase().contains("continue shopping") {
            continue;
        }
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if let Ok(target) = page_url.join(href) {
            if is_amazon_domain(&target) {
                return Some(AmazonSolveTarget {
                    method: Method::GET,
                    url: target,
                    params: Vec::new(),
                });
            }
        }
    }

    // Strategy 2: form with action + hidden fields
    for form in document.select(&FORM_SELECTOR) {
        let action = form.value().attr("action").unwrap_or("");
        let target = if action.is_empty() {
            page_url.clone()
        } else {
            match page_url.join(action) {
                Ok(url) => url,
                Err(_) => continue,
            }
        };
        if !is_amazon_domain(&target) {
            continue;
        }

        let method = match form.value().attr("method") {
            Some(m) if m.eq_ignore_ascii_case("post") => Method::POST,
            _ => Method::GET,
        };
        let params: Vec<(String, String)> = form
            .select(&INPUT_SELECTOR)
            .filter_map(|input| {
                let name = input.value().attr("name")?;
                Some((
                    name.to_string(),
                    input.value().attr("value").unwrap_or("").to_string(),
                ))
            })
            .collect();

        return Some(AmazonSolveTarget {
            method,
            url: target,
            params,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_url() -> Url {
        Url::parse("https://www.amazon.com/errors/validateCaptcha").unwrap()
    }

    #[test]
    fn prefers_continue_shopping_link() {
        let body = r#"
            <html><body>
                <form method="get" action="/errors/validateCaptcha">
                    <input type="hidden" name="amzn" value="token"/>
                </form>
                <a href="/ref=cs_503_link">Continue shopping</a>
            </body></html>
        "#;
        let target = parse_amazon_captcha(body, &page_url()).expect("parsed");
        assert_eq!(target.method, Method::GET);
        assert_eq!(target.url.path(), "/ref=cs_503_link");
        assert!(target.params.is_empty());
    }

    #[test]
    fn falls_back_to_form_with_hidden_inputs() {
        let body = r#"
            <form method="GET" action="/errors/validateCaptcha">
                <input type="hidden" name="amzn" value="tok123"/>
                <input type="hidden" name="amzn-r" value="/"/>
                <input type="text" name="field-keywords"/>
            </form>
        "#;
        let target = parse_amazon_captcha(body, &page_url()).expect("parsed");
        assert_eq!(target.method, Method::GET);
        assert_eq!(target.url.path(), "/errors/validateCaptcha");
        assert!(target.params.contains(&("amzn".to_string(), "tok123".to_string())));
        assert!(target.params.contains(&("amzn-r".to_string(), "/".to_string())));
    }

    #[test]
    fn rejects_non_amazon_targets() {
        let body = r#"<a href="https://evil.example.com/">Continue shopping</a>"#;
        assert!(parse_amazon_captcha(body, &page_url()).is_none());

        let body = r#"<form action="https://evil.example.com/steal"><input name="a" value="b"/></form>"#;
        assert!(parse_amazon_captcha(body, &page_url()).is_none());
    }

    #[test]
    fn accepts_international_amazon_tlds() {
        for host in ["www.amazon.co.uk", "amazon.de", "amzn.com"] {
            let url = Url::parse(&format!("https://{host}/x")).unwrap();
            assert!(is_amazon_domain(&url), "{host}");
        }
        for host in ["amazon.evil.com", "notamazon.com"] {
            let url = Url::parse(&format!("https://{host}/x")).unwrap();
            assert!(!is_amazon_domain(&url), "{host}");
        }
    }

    #[test]
    fn unrecognized_page_is_none() {
        assert!(parse_amazon_captcha("<html><p>hello</p></html>", &page_url()).is_none());
    }
}
