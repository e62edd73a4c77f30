//! TMD (Alibaba) session warming.
//!
//! TMD only needs valid session cookies from the homepage; no JS execution.

use url::Url;

/// Homepage URL (`scheme://authority/`) for TMD session warming.
pub fn tmd_homepage_url(url: &Url) -> Url {
    url.join("/").unwrap_or_else(|_| url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_path_and_query() {
        let url = Url::parse("https://item.taobao.com/item.htm?id=1&spm=2").unwrap();
        assert_eq!(
            tmd_homepage_url(&url).as_str(),
            "https://item.taobao.com/"
        );
    }

    #[test]
    fn keeps_explicit_port() {
        let url = Url::parse("http://shop.example.com:8080/p/x").unwrap();
        assert_eq!(
            tmd_homepage_url(&url).as_str(),
            "http://shop.example.com:8080/"
        );
    }
}
